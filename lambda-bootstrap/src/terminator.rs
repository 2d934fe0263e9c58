use crate::Error;
use futures::future::BoxFuture;
use lambda_bootstrap_client::RequestId;
use std::fmt;
use std::sync::{Arc, Mutex};

/// The future a termination hook resolves to.
pub type HookFuture = BoxFuture<'static, Result<(), Error>>;

type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

/// Identifies a registered termination hook for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationKey(RequestId);

struct Entry {
    key: RegistrationKey,
    name: String,
    hook: Hook,
}

/// An ordered registry of shutdown hooks, drained in reverse registration
/// order when the runtime exits.
#[derive(Clone, Default)]
pub struct Terminator {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl Terminator {
    /// An empty registry.
    pub fn new() -> Terminator {
        Terminator::default()
    }

    /// Append a named hook. Later registrations run earlier on shutdown.
    pub fn register(
        &self,
        name: impl Into<String>,
        hook: impl FnOnce() -> HookFuture + Send + 'static,
    ) -> RegistrationKey {
        let key = RegistrationKey(RequestId::generate());
        let mut entries = self.entries.lock().expect("terminator lock");
        entries.push(Entry {
            key,
            name: name.into(),
            hook: Box::new(hook),
        });
        key
    }

    /// Remove a hook before it runs. Unknown keys are ignored.
    pub fn deregister(&self, key: RegistrationKey) {
        let mut entries = self.entries.lock().expect("terminator lock");
        entries.retain(|entry| entry.key != key);
    }

    /// Run every registered hook, newest first, collecting all failures.
    /// Called once, when the invocation loop has exited.
    pub async fn terminate(&self) -> Result<(), TerminationError> {
        let entries = {
            let mut entries = self.entries.lock().expect("terminator lock");
            std::mem::take(&mut *entries)
        };
        let mut underlying = Vec::new();
        for entry in entries.into_iter().rev() {
            tracing::debug!(name = %entry.name, "running termination hook");
            if let Err(err) = (entry.hook)().await {
                tracing::error!(name = %entry.name, error = %err, "termination hook failed");
                underlying.push(err);
            }
        }
        if underlying.is_empty() {
            Ok(())
        } else {
            Err(TerminationError { underlying })
        }
    }
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("Terminator")
            .field("registered", &registered)
            .finish()
    }
}

/// One or more termination hooks failed.
#[derive(Debug)]
pub struct TerminationError {
    /// The individual hook failures, in execution (reverse registration)
    /// order.
    pub underlying: Vec<Error>,
}

impl fmt::Display for TerminationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} termination hook(s) failed: ", self.underlying.len())?;
        for (i, err) in self.underlying.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TerminationError {}
