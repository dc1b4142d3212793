//! Persisted bearer token and the authentication side channel.
//!
//! The token is the only state that survives a restart. It lives in a small
//! SQLite database under the user data directory. Everything that reads the
//! token goes through [`Session`], and a 401 from any endpoint expires it
//! through [`Session::expire`], which is published to subscribers as
//! [`AuthState::Expired`].

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  token TEXT NOT NULL,
  saved_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
  Anonymous,
  Authenticated,
  /// The server rejected the stored token; the user has to log in again
  Expired,
}

struct State {
  conn: Connection,
  token: Option<String>,
  /// Token supplied from the environment, never written to disk
  transient: bool,
}

/// Shared handle to the session store. Cloning is cheap.
#[derive(Clone)]
pub struct Session {
  state: Arc<Mutex<State>>,
  auth: Arc<watch::Sender<AuthState>>,
}

impl Session {
  /// Open or create the session database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
    }
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open session database at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Open the session database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// A session that is never written to disk.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory session database: {}", e))?;
    Self::with_connection(conn)
  }

  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("bookdesk").join("session.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run session migrations: {}", e))?;

    let token: Option<String> = conn
      .query_row("SELECT token FROM session WHERE id = 1", [], |row| row.get(0))
      .optional()
      .map_err(|e| eyre!("Failed to read session token: {}", e))?;

    let initial = if token.is_some() {
      AuthState::Authenticated
    } else {
      AuthState::Anonymous
    };
    let (auth, _) = watch::channel(initial);

    Ok(Self {
      state: Arc::new(Mutex::new(State {
        conn,
        token,
        transient: false,
      })),
      auth: Arc::new(auth),
    })
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn token(&self) -> Option<String> {
    self.lock().token.clone()
  }

  pub fn is_authenticated(&self) -> bool {
    self.lock().token.is_some()
  }

  pub fn auth_state(&self) -> AuthState {
    *self.auth.borrow()
  }

  /// Store a token and persist it.
  pub fn set_token(&self, token: &str) -> Result<()> {
    let mut state = self.lock();
    state
      .conn
      .execute(
        "INSERT INTO session (id, token, saved_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET token = excluded.token, saved_at = excluded.saved_at",
        params![token, chrono::Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to save session token: {}", e))?;
    state.token = Some(token.to_string());
    state.transient = false;
    drop(state);

    self.auth.send_replace(AuthState::Authenticated);
    Ok(())
  }

  /// Use `token` for this process only, leaving the stored one alone.
  pub fn use_token(&self, token: &str) {
    let mut state = self.lock();
    state.token = Some(token.to_string());
    state.transient = true;
    drop(state);
    self.auth.send_replace(AuthState::Authenticated);
  }

  /// Forget the token (logout).
  pub fn clear(&self) -> Result<()> {
    self.forget()?;
    self.auth.send_replace(AuthState::Anonymous);
    Ok(())
  }

  /// The server rejected the token. Forget it and tell subscribers.
  pub fn expire(&self) {
    if let Err(err) = self.forget() {
      warn!(error = %err, "failed to remove expired session token");
    }
    warn!("session expired");
    self.auth.send_replace(AuthState::Expired);
  }

  fn forget(&self) -> Result<()> {
    let mut state = self.lock();
    let transient = state.transient;
    state.token = None;
    state.transient = false;
    if transient {
      debug!("dropping environment-supplied token");
      return Ok(());
    }
    state
      .conn
      .execute("DELETE FROM session WHERE id = 1", [])
      .map_err(|e| eyre!("Failed to delete session token: {}", e))?;
    Ok(())
  }

  /// Follow authentication state changes.
  pub fn subscribe(&self) -> watch::Receiver<AuthState> {
    self.auth.subscribe()
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("state", &self.auth_state())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_token_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("session.db");

    let session = Session::open(&path).unwrap();
    assert_eq!(session.auth_state(), AuthState::Anonymous);
    session.set_token("abc").unwrap();
    drop(session);

    let reopened = Session::open(&path).unwrap();
    assert_eq!(reopened.token().as_deref(), Some("abc"));
    assert_eq!(reopened.auth_state(), AuthState::Authenticated);
  }

  #[test]
  fn test_clear_removes_stored_token() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.db");

    let session = Session::open(&path).unwrap();
    session.set_token("abc").unwrap();
    session.set_token("def").unwrap();
    assert_eq!(session.token().as_deref(), Some("def"));

    session.clear().unwrap();
    assert!(session.token().is_none());
    assert!(Session::open(&path).unwrap().token().is_none());
  }

  #[test]
  fn test_expire_notifies_subscribers() {
    let session = Session::in_memory().unwrap();
    session.set_token("abc").unwrap();
    let mut rx = session.subscribe();
    rx.borrow_and_update();

    session.expire();

    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow(), AuthState::Expired);
    assert!(!session.is_authenticated());
  }

  #[test]
  fn test_transient_token_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.db");

    let session = Session::open(&path).unwrap();
    session.set_token("stored").unwrap();
    session.use_token("from-env");
    assert_eq!(session.token().as_deref(), Some("from-env"));

    // Expiring the override leaves the stored token in place
    session.expire();
    drop(session);
    assert_eq!(Session::open(&path).unwrap().token().as_deref(), Some("stored"));
  }
}
