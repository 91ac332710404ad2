//! User store.
//!
//! Append-only user vector with `uid` stability, single-session exclusivity
//! per account, a symmetric follow/follower graph, and salted-password
//! persistence to a flat append-only file. Grounded on
//! `original_source/robin/src/robin_user.c`.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::errors::{AuthError, Error};
use crate::password;

pub const MAX_EMAIL_LEN: usize = 63;
pub const MAX_PASSWORD_LEN: usize = 63;

pub type Uid = usize;

/// Result of `add`: registered, rejected for format, or already taken.
#[derive(Debug, Eq, PartialEq)]
pub enum AddOutcome {
    Ok(Uid),
    BadFormat,
    AlreadyExists,
}

/// Result of `follow`/`unfollow` for a single target email.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum EdgeCode {
    Ok = 0,
    NoSuchEmail = 1,
    NoChange = 2,
}

struct User {
    email: String,
    password_hash: String,
    /// Mutated only by the owning acquirer; no lock beyond acquisition.
    following: Mutex<HashSet<Uid>>,
    /// May be mutated by any other acquirer doing `follow(self)`; needs
    /// its own guard.
    followers: Mutex<HashSet<Uid>>,
    /// Try-lock stand-in for `pthread_mutex_trylock`.
    acquired: AtomicBool,
}

/// The shared, thread-safe user store.
pub struct UserStore {
    users: Mutex<Vec<User>>,
    file: Option<PathBuf>,
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore {
    pub fn new() -> Self {
        UserStore {
            users: Mutex::new(Vec::new()),
            file: None,
        }
    }

    /// Loads users from `path`, creating it if absent, and remembers the
    /// path so future `add` calls persist to it. Duplicate `email:hash`
    /// lines (e.g. from a crash mid-append) are tolerated and ignored.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let store = UserStore::new();
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (email, hash) = line.split_once(':').ok_or_else(|| {
                Error::Internal(format!("malformed line in user file: {line:?}"))
            })?;

            // A crash between writing the line and the next load can
            // produce duplicates; treat them as already-registered rather
            // than failing the whole load.
            match store.insert(email, hash.to_string(), false)? {
                AddOutcome::Ok(_) | AddOutcome::AlreadyExists => {}
                AddOutcome::BadFormat => {
                    return Err(Error::Internal(format!(
                        "invalid stored user record: {email:?}"
                    )))
                }
            }
        }

        Ok(UserStore {
            users: store.users,
            file: Some(path),
        })
    }

    /// Registers a new account. Hashes `password` with a fresh salt and,
    /// if the store was `load`ed from a file, appends `email:hash\n`.
    pub fn add(&self, email: &str, password: &str) -> Result<AddOutcome, Error> {
        if !validate_email(email) || !validate_password(password) {
            return Ok(AddOutcome::BadFormat);
        }

        let hashed = password::hash(password, None)?;
        self.insert(email, hashed, true)
    }

    /// Inserts the user if `email` isn't already taken, under the vector
    /// mutex. When `persist` is true and the store has a backing file,
    /// appends the `email:hash` line.
    fn insert(&self, email: &str, password_hash: String, persist: bool) -> Result<AddOutcome, Error> {
        let mut users = self.users.lock();

        if users.iter().any(|u| u.email == email) {
            return Ok(AddOutcome::AlreadyExists);
        }

        let uid = users.len();
        users.push(User {
            email: email.to_string(),
            password_hash: password_hash.clone(),
            following: Mutex::new(HashSet::new()),
            followers: Mutex::new(HashSet::new()),
            acquired: AtomicBool::new(false),
        });
        drop(users);

        if persist {
            if let Some(path) = &self.file {
                let line = format!("{email}:{password_hash}\n");
                let mut fp = OpenOptions::new().append(true).open(path)?;
                fp.write_all(line.as_bytes())?;
            }
        }

        Ok(AddOutcome::Ok(uid))
    }

    /// Verifies credentials and, on success, atomically claims the user's
    /// `acquired` flag. Order of checks: existence, password, acquisition.
    pub fn acquire(&self, email: &str, password: &str) -> Result<Uid, Error> {
        let users = self.users.lock();

        let (uid, stored_hash) = users
            .iter()
            .enumerate()
            .find(|(_, u)| u.email == email)
            .map(|(uid, u)| (uid, u.password_hash.clone()))
            .ok_or(Error::Auth(AuthError::NoSuchEmail))?;

        if !password::verify(password, &stored_hash)? {
            return Err(Error::Auth(AuthError::BadPassword));
        }

        let user = &users[uid];
        if user
            .acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Auth(AuthError::Busy));
        }

        Ok(uid)
    }

    /// Releases a previously acquired user. Idempotent.
    pub fn release(&self, uid: Uid) {
        let users = self.users.lock();
        if let Some(user) = users.get(uid) {
            user.acquired.store(false, Ordering::Release);
        }
    }

    pub fn email_of(&self, uid: Uid) -> Result<String, Error> {
        let users = self.users.lock();
        let user = users.get(uid).ok_or(Error::Internal("invalid uid".into()))?;
        if !user.acquired.load(Ordering::Acquire) {
            return Err(Error::Internal("uid not acquired".into()));
        }
        Ok(user.email.clone())
    }

    pub fn following_of(&self, uid: Uid) -> Result<Vec<String>, Error> {
        let users = self.users.lock();
        let user = users.get(uid).ok_or(Error::Internal("invalid uid".into()))?;
        if !user.acquired.load(Ordering::Acquire) {
            return Err(Error::Internal("uid not acquired".into()));
        }
        let following = user.following.lock();
        Ok(following.iter().map(|&u| users[u].email.clone()).collect())
    }

    pub fn followers_of(&self, uid: Uid) -> Result<Vec<String>, Error> {
        let users = self.users.lock();
        let user = users.get(uid).ok_or(Error::Internal("invalid uid".into()))?;
        if !user.acquired.load(Ordering::Acquire) {
            return Err(Error::Internal("uid not acquired".into()));
        }
        let followers = user.followers.lock();
        Ok(followers.iter().map(|&u| users[u].email.clone()).collect())
    }

    /// Follows the user identified by `email`. Mutates both endpoints of
    /// the edge under the single users lock to preserve the
    /// follow/follower symmetry invariant, matching
    /// `robin_user_follow`'s two-sided update.
    pub fn follow(&self, uid: Uid, email: &str) -> Result<EdgeCode, Error> {
        let users = self.users.lock();

        let target = match users.iter().position(|u| u.email == email) {
            Some(t) if t == uid => return Ok(EdgeCode::NoSuchEmail), // no self-follow 
            Some(t) => t,
            None => return Ok(EdgeCode::NoSuchEmail),
        };

        {
            let mut following = users[uid].following.lock();
            if !following.insert(target) {
                return Ok(EdgeCode::NoChange);
            }
        }

        users[target].followers.lock().insert(uid);

        Ok(EdgeCode::Ok)
    }

    pub fn unfollow(&self, uid: Uid, email: &str) -> Result<EdgeCode, Error> {
        let users = self.users.lock();

        let target = match users.iter().position(|u| u.email == email) {
            Some(t) => t,
            None => return Ok(EdgeCode::NoSuchEmail),
        };

        let removed = users[uid].following.lock().remove(&target);
        if !removed {
            return Ok(EdgeCode::NoChange);
        }

        users[target].followers.lock().remove(&uid);

        Ok(EdgeCode::Ok)
    }

    /// Drops all in-memory state. The on-disk file, if any, is untouched.
    pub fn shutdown(&self) {
        self.users.lock().clear();
    }

    /// Number of registered accounts, for startup logging.
    pub fn count(&self) -> usize {
        self.users.lock().len()
    }
}

/// Validates an email: length in `[1, 63]`, no newline, no `:`, and no
/// embedded spaces, since the client's reply tokenizer relies on emails
/// never containing one.
pub fn validate_email(email: &str) -> bool {
    !email.is_empty()
        && email.len() <= MAX_EMAIL_LEN
        && !email.contains('\n')
        && !email.contains(':')
        && !email.contains(' ')
}

/// Validates a password: length in `[1, 63]`, no newline.
pub fn validate_password(password: &str) -> bool {
    !password.is_empty() && password.len() <= MAX_PASSWORD_LEN && !password.contains('\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_uniqueness() {
        let store = UserStore::new();
        assert!(matches!(
            store.add("a@x.com", "pw").unwrap(),
            AddOutcome::Ok(0)
        ));
        assert_eq!(
            store.add("a@x.com", "pw2").unwrap(),
            AddOutcome::AlreadyExists
        );
    }

    #[test]
    fn rejects_bad_format() {
        let store = UserStore::new();
        assert_eq!(store.add("", "pw").unwrap(), AddOutcome::BadFormat);
        assert_eq!(
            store.add("has space@x.com", "pw").unwrap(),
            AddOutcome::BadFormat
        );
        assert_eq!(
            store.add("a@x.com", "has\nnewline").unwrap(),
            AddOutcome::BadFormat
        );
    }

    #[test]
    fn acquire_then_second_acquire_is_busy() {
        let store = UserStore::new();
        store.add("a@x.com", "pw").unwrap();

        let uid = store.acquire("a@x.com", "pw").unwrap();
        assert!(matches!(
            store.acquire("a@x.com", "pw"),
            Err(Error::Auth(AuthError::Busy))
        ));

        store.release(uid);
        assert!(store.acquire("a@x.com", "pw").is_ok());
    }

    #[test]
    fn acquire_rejects_bad_password_and_missing_email() {
        let store = UserStore::new();
        store.add("a@x.com", "pw").unwrap();

        assert!(matches!(
            store.acquire("a@x.com", "wrong"),
            Err(Error::Auth(AuthError::BadPassword))
        ));
        assert!(matches!(
            store.acquire("missing@x.com", "pw"),
            Err(Error::Auth(AuthError::NoSuchEmail))
        ));
    }

    #[test]
    fn follow_is_symmetric() {
        let store = UserStore::new();
        store.add("a@x.com", "pw").unwrap();
        store.add("b@x.com", "pw").unwrap();
        let a = store.acquire("a@x.com", "pw").unwrap();
        let b = store.acquire("b@x.com", "pw").unwrap();

        assert_eq!(store.follow(a, "b@x.com").unwrap(), EdgeCode::Ok);
        assert_eq!(store.following_of(a).unwrap(), vec!["b@x.com"]);
        assert_eq!(store.followers_of(b).unwrap(), vec!["a@x.com"]);

        assert_eq!(store.follow(a, "b@x.com").unwrap(), EdgeCode::NoChange);
        assert_eq!(store.unfollow(a, "b@x.com").unwrap(), EdgeCode::Ok);
        assert!(store.following_of(a).unwrap().is_empty());
        assert!(store.followers_of(b).unwrap().is_empty());
    }

    #[test]
    fn following_and_followers_require_acquisition() {
        let store = UserStore::new();
        store.add("a@x.com", "pw").unwrap();
        store.add("b@x.com", "pw").unwrap();
        let a = store.acquire("a@x.com", "pw").unwrap();
        store.follow(a, "b@x.com").unwrap();

        // `b` was never acquired: querying its follow/follower lists by uid
        // must fail rather than silently returning another session's data.
        let b = 1;
        assert!(matches!(
            store.following_of(b),
            Err(Error::Internal(_))
        ));
        assert!(matches!(store.followers_of(b), Err(Error::Internal(_))));
    }

    #[test]
    fn no_self_follow() {
        let store = UserStore::new();
        store.add("a@x.com", "pw").unwrap();
        let a = store.acquire("a@x.com", "pw").unwrap();
        assert_eq!(store.follow(a, "a@x.com").unwrap(), EdgeCode::NoSuchEmail);
    }

    #[test]
    fn follow_unknown_email() {
        let store = UserStore::new();
        store.add("a@x.com", "pw").unwrap();
        let a = store.acquire("a@x.com", "pw").unwrap();
        assert_eq!(
            store.follow(a, "ghost@x.com").unwrap(),
            EdgeCode::NoSuchEmail
        );
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.txt");

        {
            let store = UserStore::load(&path).unwrap();
            store.add("a@x.com", "pw").unwrap();
        }

        let store = UserStore::load(&path).unwrap();
        assert!(store.acquire("a@x.com", "pw").is_ok());
    }

    #[test]
    fn reload_tolerates_duplicate_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.txt");

        std::fs::write(&path, "a@x.com:aaSomeHash\na@x.com:aaSomeHash\n").unwrap();

        let store = UserStore::load(&path).unwrap();
        assert!(store.acquire("a@x.com", "wrong").is_err());
    }
}
