//! Scoped services started and stopped with the process.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Start order of a [`Scoped`] service. Lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScopedPriority {
    /// Runs before everything else, e.g. diagnostics checks.
    StrictMode,
    None,
}

/// Shared by every service of one scope. Cancelled when the scope exits.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    cancel: CancellationToken,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
pub trait Scoped: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> ScopedPriority {
        ScopedPriority::None
    }

    async fn on_enter_scope(&self, scope: &Scope);

    async fn on_exit_scope(&self);
}

/// Enters services ordered by `(priority, name)` and exits them in reverse.
pub struct ScopeController {
    services: Vec<Arc<dyn Scoped>>,
    scope: Scope,
}

impl ScopeController {
    pub fn new(mut services: Vec<Arc<dyn Scoped>>) -> Self {
        services.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self {
            services,
            scope: Scope::new(),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub async fn enter(&self) {
        for service in &self.services {
            info!(service = service.name(), "Entering scope");
            service.on_enter_scope(&self.scope).await;
        }
    }

    pub async fn exit(&self) {
        self.scope.cancel.cancel();
        for service in self.services.iter().rev() {
            info!(service = service.name(), "Exiting scope");
            service.on_exit_scope().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        priority: ScopedPriority,
        log: Log,
    }

    #[async_trait]
    impl Scoped for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> ScopedPriority {
            self.priority
        }

        async fn on_enter_scope(&self, scope: &Scope) {
            assert!(!scope.token().is_cancelled());
            self.log.lock().unwrap().push(format!("enter {}", self.name));
        }

        async fn on_exit_scope(&self) {
            self.log.lock().unwrap().push(format!("exit {}", self.name));
        }
    }

    fn recorder(name: &'static str, priority: ScopedPriority, log: &Log) -> Arc<dyn Scoped> {
        Arc::new(Recorder {
            name,
            priority,
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn test_enter_in_priority_then_name_order_exit_in_reverse() {
        let log = Log::default();
        let controller = ScopeController::new(vec![
            recorder("b", ScopedPriority::None, &log),
            recorder("z", ScopedPriority::StrictMode, &log),
            recorder("a", ScopedPriority::None, &log),
        ]);

        controller.enter().await;
        controller.exit().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter z", "enter a", "enter b", "exit b", "exit a", "exit z"]
        );
        assert!(controller.scope().token().is_cancelled());
    }
}
