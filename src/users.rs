use std::{collections::HashMap, fs::read_to_string, path::Path, sync::Arc};

use dashmap::DashMap;
use log::debug;
use regex::Regex;

use crate::{error::ServerError, protocol::RemoteSpec};

// Pattern granting access to every remote, used for --auth users.
const ALLOW_ALL_PATTERN: &str = ".*";

// A credential pair plus the remote addresses it may request.
#[derive(Debug, Clone)]
pub(crate) struct User {
    pub(crate) name: String,
    password: String,
    // Matched against the literal `host:port` string. An empty list
    // denies every remote.
    addr_patterns: Vec<Regex>,
}

impl User {
    pub(crate) fn has_access(&self, addr: &str) -> bool {
        self.addr_patterns.iter().any(|pattern| pattern.is_match(addr))
    }
}

// Credentials lookup table. An empty table disables authentication
// entirely: any password is accepted and no access checks apply.
#[derive(Debug, Default)]
pub(crate) struct UserTable(HashMap<String, Arc<User>>);

impl UserTable {
    // Load users from a JSON file mapping "name:password" pairs to
    // arrays of remote address patterns.
    pub(crate) fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = read_to_string(path)
            .map_err(|_| ServerError::UnreadableCredentialsFile(path.to_path_buf()))?;
        let raw: HashMap<String, Vec<String>> = serde_json::from_str(&data)
            .map_err(|_| ServerError::UnreadableCredentialsFile(path.to_path_buf()))?;
        let mut table = UserTable::default();
        for (credentials, patterns) in raw {
            let (name, password) =
                parse_credentials(&credentials).ok_or(ServerError::InvalidCredentialPair)?;
            let addr_patterns = patterns
                .iter()
                .map(|pattern| Regex::new(pattern))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| ServerError::InvalidAddressPattern(name.clone()))?;
            table.insert(User {
                name,
                password,
                addr_patterns,
            });
        }
        Ok(table)
    }

    // Add a single "name:password" user allowed any remote.
    pub(crate) fn insert_credentials(&mut self, credentials: &str) -> anyhow::Result<()> {
        let (name, password) =
            parse_credentials(credentials).ok_or(ServerError::InvalidCredentialPair)?;
        self.insert(User {
            name,
            password,
            addr_patterns: vec![Regex::new(ALLOW_ALL_PATTERN).unwrap()],
        });
        Ok(())
    }

    pub(crate) fn insert(&mut self, user: User) {
        self.0.insert(user.name.clone(), Arc::new(user));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn parse_credentials(credentials: &str) -> Option<(String, String)> {
    let (name, password) = credentials.split_once(':')?;
    if name.is_empty() {
        return None;
    }
    Some((name.into(), password.into()))
}

// Result of a password check against the user table.
#[derive(Debug)]
pub(crate) enum AuthOutcome {
    // Authentication is disabled; the session has no access limits.
    Unrestricted,
    // Credentials matched; the session is bound to this user.
    Bound(Arc<User>),
    // Unknown user or wrong password. Callers must not distinguish.
    Denied,
}

// Validates credentials and tracks which user each live session
// authenticated as. Owned by the server value; the SSH authentication
// callback inserts bindings and session teardown removes them.
#[derive(Debug, Default)]
pub(crate) struct Authenticator {
    users: UserTable,
    sessions: DashMap<usize, Arc<User>>,
}

impl Authenticator {
    pub(crate) fn new(users: UserTable) -> Self {
        Authenticator {
            users,
            sessions: DashMap::new(),
        }
    }

    pub(crate) fn auth_enabled(&self) -> bool {
        !self.users.is_empty()
    }

    pub(crate) fn authenticate(
        &self,
        session_id: usize,
        name: &str,
        password: &str,
    ) -> AuthOutcome {
        if self.users.is_empty() {
            return AuthOutcome::Unrestricted;
        }
        match self.users.0.get(name) {
            Some(user) if user.password == password => {
                self.sessions.insert(session_id, Arc::clone(user));
                AuthOutcome::Bound(Arc::clone(user))
            }
            _ => {
                debug!("Login failed: {}", name);
                AuthOutcome::Denied
            }
        }
    }

    // Remove the session binding. Runs on every session exit path.
    pub(crate) fn release(&self, session_id: usize) {
        self.sessions.remove(&session_id);
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self, session_id: usize) -> bool {
        self.sessions.contains_key(&session_id)
    }

    // Verify that a user may reach every requested remote. SOCKS
    // streams are passed through; access to them is controlled by the
    // server-wide SOCKS5 toggle instead.
    pub(crate) fn check_remotes(
        &self,
        user: &User,
        remotes: &[RemoteSpec],
    ) -> Result<(), ServerError> {
        for remote in remotes {
            if remote.is_socks() {
                continue;
            }
            let addr = remote.address();
            if !user.has_access(&addr) {
                return Err(ServerError::AccessDenied(addr));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod users_tests {
    use regex::Regex;

    use super::{AuthOutcome, Authenticator, User, UserTable};
    use crate::protocol::RemoteSpec;

    fn user(name: &str, password: &str, patterns: &[&str]) -> User {
        User {
            name: name.into(),
            password: password.into(),
            addr_patterns: patterns.iter().map(|p| Regex::new(p).unwrap()).collect(),
        }
    }

    fn remote(host: &str, port: &str) -> RemoteSpec {
        RemoteSpec {
            remote_host: host.into(),
            remote_port: port.into(),
        }
    }

    #[test]
    fn matches_address_patterns_in_order() {
        let alice = user("alice", "pw", &["^allowed\\.com:80$", "^10\\.0\\..*"]);
        assert!(alice.has_access("allowed.com:80"));
        assert!(alice.has_access("10.0.0.5:22"));
        assert!(!alice.has_access("allowed.com:8080"));
        assert!(!alice.has_access("denied.com:80"));
    }

    #[test]
    fn denies_all_remotes_without_patterns() {
        let bob = user("bob", "pw", &[]);
        assert!(!bob.has_access("anything:1"));
    }

    #[test]
    fn accepts_anyone_with_empty_table() {
        let auth = Authenticator::new(UserTable::default());
        assert!(!auth.auth_enabled());
        assert!(matches!(
            auth.authenticate(1, "whoever", "whatever"),
            AuthOutcome::Unrestricted
        ));
        assert!(!auth.is_bound(1), "unrestricted sessions have no binding");
    }

    #[test]
    fn binds_and_releases_sessions() {
        let mut table = UserTable::default();
        table.insert(user("alice", "pw", &[".*"]));
        let auth = Authenticator::new(table);

        assert!(matches!(
            auth.authenticate(7, "alice", "pw"),
            AuthOutcome::Bound(_)
        ));
        assert!(auth.is_bound(7));
        auth.release(7);
        assert!(!auth.is_bound(7));
    }

    #[test]
    fn denies_unknown_user_and_wrong_password_alike() {
        let mut table = UserTable::default();
        table.insert(user("alice", "pw", &[".*"]));
        let auth = Authenticator::new(table);

        assert!(matches!(
            auth.authenticate(1, "alice", "wrong"),
            AuthOutcome::Denied
        ));
        assert!(matches!(
            auth.authenticate(2, "nobody", "pw"),
            AuthOutcome::Denied
        ));
        assert!(!auth.is_bound(1));
        assert!(!auth.is_bound(2));
    }

    #[test]
    fn checks_every_remote_and_names_the_denied_one() {
        let auth = Authenticator::new(UserTable::default());
        let alice = user("alice", "pw", &["^allowed\\.com:80$"]);

        assert!(auth
            .check_remotes(&alice, &[remote("allowed.com", "80")])
            .is_ok());
        let err = auth
            .check_remotes(
                &alice,
                &[remote("allowed.com", "80"), remote("denied.com", "80")],
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "access to 'denied.com:80' denied");
    }

    #[test]
    fn passes_socks_remotes_through() {
        let auth = Authenticator::new(UserTable::default());
        let alice = user("alice", "pw", &["^allowed\\.com:80$"]);

        assert!(auth.check_remotes(&alice, &[remote("socks", "")]).is_ok());
    }

    #[test]
    fn merges_single_user_credentials() {
        let mut table = UserTable::default();
        table.insert_credentials("carol:hunter2").unwrap();
        let auth = Authenticator::new(table);

        let AuthOutcome::Bound(carol) = auth.authenticate(1, "carol", "hunter2") else {
            panic!("expected carol to authenticate");
        };
        assert!(carol.has_access("anywhere.example:12345"));
        assert!(table_rejects_malformed_pairs());
    }

    fn table_rejects_malformed_pairs() -> bool {
        let mut table = UserTable::default();
        table.insert_credentials("no-separator").is_err()
            && table.insert_credentials(":empty-name").is_err()
    }
}
