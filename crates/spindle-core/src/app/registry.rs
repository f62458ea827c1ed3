//! JobRegistry - 名前から Job を組み立てる
//!
//! # フロー
//! 1. 起動時に job factory と bootstrapper を名前で登録（mutable）
//! 2. `resolve(job, bootstrapper?)` で bootstrapper が `Services` を埋める
//! 3. factory が `Services` から依存を取り出して `Arc<dyn Job>` を作る
//!
//! The engine only ever sees the resulting `Arc<dyn Job>`.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::ResolveError;

use super::job::Job;

/// Type map of shared dependencies handed to job factories.
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the service of type `S`.
    pub fn insert<S: Any + Send + Sync>(&mut self, service: S) -> &mut Self {
        self.insert_arc(Arc::new(service))
    }

    pub fn insert_arc<S: Any + Send + Sync>(&mut self, service: Arc<S>) -> &mut Self {
        self.entries.insert(TypeId::of::<S>(), service);
        self
    }

    pub fn get<S: Any + Send + Sync>(&self) -> Option<Arc<S>> {
        self.entries
            .get(&TypeId::of::<S>())
            .cloned()
            .and_then(|service| service.downcast::<S>().ok())
    }

    /// Like [`get`](Self::get), but a missing service is a resolution error
    /// naming the job that needed it.
    pub fn require<S: Any + Send + Sync>(&self, job: &str) -> Result<Arc<S>, ResolveError> {
        self.get::<S>().ok_or_else(|| ResolveError::MissingDependency {
            job: job.to_string(),
            dependency: type_name::<S>(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Populates [`Services`] before a job is constructed.
pub trait Bootstrapper: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&self, services: &mut Services) -> Result<(), String>;
}

type JobFactory = Arc<dyn Fn(&Services) -> Result<Arc<dyn Job>, ResolveError> + Send + Sync>;

/// Registry of job factories and bootstrappers (name -> constructor).
///
/// # 使用例
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register_job("hello", |_| Ok(Arc::new(HelloWorldJob) as Arc<dyn Job>))?;
/// registry.register_bootstrapper(Arc::new(AppBootstrapper))?;
///
/// let job = registry.resolve("hello", Some("app"))?;
/// ```
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, JobFactory>,
    bootstrappers: HashMap<String, Arc<dyn Bootstrapper>>,
    default_bootstrapper: Option<String>,
    services: Services,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_job<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), ResolveError>
    where
        F: Fn(&Services) -> Result<Arc<dyn Job>, ResolveError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.jobs.contains_key(&name) {
            return Err(ResolveError::DuplicateJob(name));
        }
        self.jobs.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn register_bootstrapper(
        &mut self,
        bootstrapper: Arc<dyn Bootstrapper>,
    ) -> Result<(), ResolveError> {
        let name = bootstrapper.name().to_string();
        if self.bootstrappers.contains_key(&name) {
            return Err(ResolveError::DuplicateBootstrapper(name));
        }
        self.bootstrappers.insert(name, bootstrapper);
        Ok(())
    }

    /// Bootstrapper applied when `resolve` is not given one. It must already
    /// be registered.
    pub fn set_default_bootstrapper(&mut self, name: impl Into<String>) -> Result<(), ResolveError> {
        let name = name.into();
        if !self.bootstrappers.contains_key(&name) {
            return Err(ResolveError::UnknownBootstrapper(name));
        }
        self.default_bootstrapper = Some(name);
        Ok(())
    }

    /// Services every resolution starts from.
    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut Services {
        &mut self.services
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct the job registered under `job`.
    ///
    /// Each call starts from a copy of the base services, so bootstrappers
    /// never leak state between resolutions.
    pub fn resolve(
        &self,
        job: &str,
        bootstrapper: Option<&str>,
    ) -> Result<Arc<dyn Job>, ResolveError> {
        let factory = self
            .jobs
            .get(job)
            .ok_or_else(|| ResolveError::UnknownJob(job.to_string()))?;

        let mut services = self.services.clone();
        if let Some(name) = bootstrapper.or(self.default_bootstrapper.as_deref()) {
            let bootstrapper = self
                .bootstrappers
                .get(name)
                .ok_or_else(|| ResolveError::UnknownBootstrapper(name.to_string()))?;
            bootstrapper
                .configure(&mut services)
                .map_err(|reason| ResolveError::Bootstrap {
                    name: name.to_string(),
                    reason,
                })?;
            tracing::debug!(bootstrapper = name, services = services.len(), "bootstrapped");
        }

        let resolved = factory(&services)?;
        tracing::debug!(job, "job resolved");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::domain::{JobError, JobResult};

    struct Greeting(String);

    struct GreetJob {
        greeting: Arc<Greeting>,
    }

    #[async_trait]
    impl Job for GreetJob {
        fn name(&self) -> &str {
            "greet"
        }

        async fn run_once(&self, _cancel: &CancellationToken) -> Result<JobResult, JobError> {
            Ok(JobResult::success().with_reason(self.greeting.0.clone()))
        }
    }

    struct GreetingBootstrapper;

    impl Bootstrapper for GreetingBootstrapper {
        fn name(&self) -> &str {
            "greeting"
        }

        fn configure(&self, services: &mut Services) -> Result<(), String> {
            services.insert(Greeting("hi".to_string()));
            Ok(())
        }
    }

    struct BrokenBootstrapper;

    impl Bootstrapper for BrokenBootstrapper {
        fn name(&self) -> &str {
            "broken"
        }

        fn configure(&self, _services: &mut Services) -> Result<(), String> {
            Err("database unreachable".to_string())
        }
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry
            .register_job("greet", |services: &Services| {
                let greeting = services.require::<Greeting>("greet")?;
                Ok(Arc::new(GreetJob { greeting }) as Arc<dyn Job>)
            })
            .unwrap();
        registry
            .register_bootstrapper(Arc::new(GreetingBootstrapper))
            .unwrap();
        registry
            .register_bootstrapper(Arc::new(BrokenBootstrapper))
            .unwrap();
        registry
    }

    #[test]
    fn services_round_trip_by_type() {
        let mut services = Services::new();
        services.insert(5_u32).insert("five".to_string());

        assert_eq!(*services.get::<u32>().unwrap(), 5);
        assert_eq!(services.get::<String>().unwrap().as_str(), "five");
        assert!(services.get::<u64>().is_none());
        assert_eq!(services.len(), 2);
    }

    #[tokio::test]
    async fn resolves_with_named_bootstrapper() {
        let job = registry().resolve("greet", Some("greeting")).unwrap();

        let result = job.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(result.reason.as_deref(), Some("hi"));
    }

    #[test]
    fn default_bootstrapper_applies_when_none_given() {
        let mut registry = registry();
        registry.set_default_bootstrapper("greeting").unwrap();

        assert!(registry.resolve("greet", None).is_ok());
    }

    #[test]
    fn missing_dependency_names_the_type() {
        let err = registry().resolve("greet", None).err().unwrap();

        assert!(matches!(
            &err,
            ResolveError::MissingDependency { job, dependency }
                if job == "greet" && dependency.ends_with("Greeting")
        ));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let registry = registry();

        assert!(matches!(
            registry.resolve("nope", None),
            Err(ResolveError::UnknownJob(name)) if name == "nope"
        ));
        assert!(matches!(
            registry.resolve("greet", Some("nope")),
            Err(ResolveError::UnknownBootstrapper(_))
        ));
    }

    #[test]
    fn bootstrap_failure_is_a_resolution_error() {
        let err = registry().resolve("greet", Some("broken")).err().unwrap();
        assert!(err.to_string().contains("database unreachable"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();

        let dup = registry.register_job("greet", |_: &Services| {
            Err(ResolveError::UnknownJob("unused".to_string()))
        });
        assert!(matches!(dup, Err(ResolveError::DuplicateJob(_))));
        assert!(matches!(
            registry.register_bootstrapper(Arc::new(GreetingBootstrapper)),
            Err(ResolveError::DuplicateBootstrapper(_))
        ));
        assert!(matches!(
            registry.set_default_bootstrapper("missing"),
            Err(ResolveError::UnknownBootstrapper(_))
        ));
        assert_eq!(registry.job_names(), vec!["greet".to_string()]);
    }
}
