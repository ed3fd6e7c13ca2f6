//! Continuation-passing interceptor chain

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use vmhub_core::{PendingCall, Result};

/// Cross-cutting logic wrapped around one kind of protocol call.
///
/// An interceptor may mutate the call, then either run `next` (optionally
/// doing more work once it returns) or return without running it, which
/// marks the call as handled. An error skips every interceptor after it.
#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn intercept(&self, call: &mut PendingCall, next: Next<'_>) -> Result<()>;
}

/// The operation a chain wraps
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn invoke(&self, call: &mut PendingCall) -> Result<()>;
}

/// The rest of the chain after the current interceptor
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    /// Run the remaining interceptors, then the terminal
    pub async fn run(self, call: &mut PendingCall) -> Result<()> {
        match self.remaining.split_first() {
            Some((interceptor, rest)) => {
                let next = Next {
                    remaining: rest,
                    terminal: self.terminal,
                };
                interceptor.intercept(call, next).await
            }
            None => self.terminal.invoke(call).await,
        }
    }

    /// Interceptors still to run
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

/// Interceptors for one extension point, in registration order
#[derive(Clone, Default)]
pub struct Chain {
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Chain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: Arc::new(interceptors),
        }
    }

    pub async fn run(&self, call: &mut PendingCall, terminal: &dyn Terminal) -> Result<()> {
        let next = Next {
            remaining: &self.interceptors,
            terminal,
        };
        next.run(call).await
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}
