use tokio::sync::watch;

use crate::role_filter::Role;

/// Authenticated session snapshot consumed from the auth layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub identity: String,
    pub role: Role,
}

impl Session {
    pub fn new(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }
}

/// Source of the current session plus a change stream.
///
/// Subscriptions created before a session exists queue until one arrives;
/// an identity or role change forces every active subscription to be torn
/// down and recreated so role predicates are recomputed.
pub trait SessionProvider: Send + Sync {
    fn current(&self) -> Option<Session>;
    fn watch(&self) -> watch::Receiver<Option<Session>>;
}

/// Watch-channel-backed provider; the application pushes session changes in,
/// the sync client observes them.
pub struct SessionFeed {
    tx: watch::Sender<Option<Session>>,
}

impl SessionFeed {
    pub fn new(initial: Option<Session>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn signed_out() -> Self {
        Self::new(None)
    }

    /// Publishes a new session state (sign-in, sign-out, or role change).
    pub fn set(&self, session: Option<Session>) {
        // send_replace never fails even with no receivers attached yet
        self.tx.send_replace(session);
    }
}

impl SessionProvider for SessionFeed {
    fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
