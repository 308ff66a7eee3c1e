//! Per-connection context.
//!
//! Handlers read and write connection-scoped state through typed accessors:
//! each stored type is its own slot, so a "context reader" is identified by
//! the type it reads. The state hangs off an explicit per-connection value
//! bound into every dispatched [`Context`]; there is no process-wide
//! current-client key.

use std::sync::Arc;

use parking_lot::Mutex;

use tether_session::extensions::Extensions;

/// State shared by every call on one connection.
#[derive(Default)]
pub struct ConnectionContext {
    extensions: Mutex<Extensions>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure over the extension map.
    pub fn with<R>(&self, f: impl FnOnce(&mut Extensions) -> R) -> R {
        f(&mut self.extensions.lock())
    }
}

/// The context handed to each dispatched handler.
#[derive(Clone)]
pub struct Context {
    conn: Arc<ConnectionContext>,
    method: Arc<str>,
}

impl Context {
    pub(crate) fn new(conn: Arc<ConnectionContext>, method: &str) -> Self {
        Self {
            conn,
            method: method.into(),
        }
    }

    /// The method being dispatched.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Read a connection-scoped value by type.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.conn.with(|ext| ext.get::<T>().cloned())
    }

    /// Store a connection-scoped value, replacing any previous one.
    pub fn set<T: Send + Sync + 'static>(&self, value: T) {
        self.conn.with(|ext| {
            ext.insert(value);
        });
    }

    /// Mutate a connection-scoped value in place, defaulting it first.
    pub fn update<T: Default + Send + Sync + 'static, R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        self.conn.with(|ext| f(ext.get_or_insert_default::<T>()))
    }

    /// The connection this call arrived on.
    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default, PartialEq, Debug)]
    struct Visits(u32);

    #[test]
    fn typed_state_is_scoped_to_the_connection() {
        let conn = Arc::new(ConnectionContext::new());
        let first = Context::new(conn.clone(), "a");
        let second = Context::new(conn, "b");

        first.set(Visits(1));
        assert_eq!(second.get::<Visits>(), Some(Visits(1)));

        let seen = second.update::<Visits, _>(|v| {
            v.0 += 1;
            v.0
        });
        assert_eq!(seen, 2);
        assert_eq!(first.get::<Visits>(), Some(Visits(2)));
    }

    #[test]
    fn update_defaults_missing_slots() {
        let ctx = Context::new(Arc::new(ConnectionContext::new()), "m");
        let value = ctx.update::<Visits, _>(|v| {
            v.0 += 5;
            v.0
        });
        assert_eq!(value, 5);
        assert_eq!(ctx.method(), "m");
    }
}
