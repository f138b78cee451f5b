use crate::model::{Session, User};
use log::{debug, info};
use sled::transaction::{abort, ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Wrong username or password")]
    BadCredentials,

    #[error("User unrecognized: {0}")]
    UnknownUser(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Corrupt user document: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Password hashing error: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

impl From<TransactionError<IdentityError>> for IdentityError {
    fn from(err: TransactionError<IdentityError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => IdentityError::Storage(err),
        }
    }
}

/// Accounts and bearer credentials.
///
/// The watchlist service only needs [`verify`](IdentityProvider::verify),
/// [`is_user`](IdentityProvider::is_user) and
/// [`delete_user`](IdentityProvider::delete_user); the remaining methods back
/// the account routes.
pub trait IdentityProvider: Send + Sync {
    fn register(&self, username: &str, password: &str) -> Result<(), IdentityError>;
    /// Returns a new bearer credential for the user.
    fn sign_in(&self, username: &str, password: &str) -> Result<String, IdentityError>;
    /// Returns `false` if the credential was not live.
    fn sign_out(&self, credential: &str) -> Result<bool, IdentityError>;
    fn is_user(&self, username: &str) -> Result<bool, IdentityError>;
    /// Whether `credential` is a live credential of `username`.
    fn verify(&self, username: &str, credential: &str) -> Result<bool, IdentityError>;
    fn delete_user(&self, username: &str, credential: &str) -> Result<(), IdentityError>;
}

const USERS: &[u8] = b"users";
const SESSIONS: &[u8] = b"sessions";

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identity provider kept in the service's own sled database. Passwords are
/// stored as bcrypt hashes, sessions map a random token to the account that
/// signed in and expire after `session_ttl`.
pub struct LocalIdentity {
    users: sled::Tree,
    sessions: sled::Tree,
    cost: u32,
    session_ttl: Duration,
}

impl LocalIdentity {
    pub fn open(db: &sled::Db, cost: u32, session_ttl: Duration) -> sled::Result<Self> {
        Ok(LocalIdentity {
            users: db.open_tree(USERS)?,
            sessions: db.open_tree(SESSIONS)?,
            cost,
            session_ttl,
        })
    }

    fn get_user(&self, username: &str) -> Result<Option<User>, IdentityError> {
        Ok(match self.users.get(username.as_bytes())? {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        })
    }

    fn get_session(&self, token: &str) -> Result<Option<Session>, IdentityError> {
        Ok(match self.sessions.get(token.as_bytes())? {
            Some(bytes) => Some(bincode::deserialize(&bytes)?),
            None => None,
        })
    }

    /// Drops every session that has expired by `now`.
    fn purge_expired(&self, now: u64) -> Result<usize, IdentityError> {
        let mut purged = 0;
        for entry in self.sessions.iter() {
            let (token, bytes) = entry?;
            let session: Session = bincode::deserialize(&bytes)?;
            if session.is_expired(now) && self.sessions.remove(token)?.is_some() {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!("Purged {} expired sessions", purged);
        }
        Ok(purged)
    }
}

impl IdentityProvider for LocalIdentity {
    fn register(&self, username: &str, password: &str) -> Result<(), IdentityError> {
        if username.is_empty() || password.is_empty() {
            return Err(IdentityError::InvalidRequest(
                "username and password must not be empty",
            ));
        }
        let user = User {
            username: username.to_owned(),
            password_hash: bcrypt::hash(password, self.cost)?,
            account: Uuid::new_v4().simple().to_string(),
        };
        self.users
            .compare_and_swap(
                username.as_bytes(),
                None as Option<&[u8]>,
                Some(bincode::serialize(&user)?),
            )?
            .map_err(|_| IdentityError::UsernameTaken(username.to_owned()))?;
        info!("Registered user: {}", username);
        Ok(())
    }

    fn sign_in(&self, username: &str, password: &str) -> Result<String, IdentityError> {
        let user = self.get_user(username)?.ok_or(IdentityError::BadCredentials)?;
        if !bcrypt::verify(password, &user.password_hash)? {
            return Err(IdentityError::BadCredentials);
        }
        let now = now_millis();
        self.purge_expired(now)?;
        let session = Session {
            username: user.username,
            account: user.account,
            expires_at: now.saturating_add(self.session_ttl.as_millis() as u64),
        };
        let token = Uuid::new_v4().simple().to_string();
        self.sessions.insert(token.as_bytes(), bincode::serialize(&session)?)?;
        debug!("Signed in: {}", username);
        Ok(token)
    }

    fn sign_out(&self, credential: &str) -> Result<bool, IdentityError> {
        Ok(self.sessions.remove(credential.as_bytes())?.is_some())
    }

    fn is_user(&self, username: &str) -> Result<bool, IdentityError> {
        Ok(self.users.contains_key(username.as_bytes())?)
    }

    /// A session is live while it has not expired and the account that
    /// opened it still exists. Expired sessions are dropped here.
    fn verify(&self, username: &str, credential: &str) -> Result<bool, IdentityError> {
        let session = match self.get_session(credential)? {
            Some(session) => session,
            None => return Ok(false),
        };
        if session.is_expired(now_millis()) {
            self.sessions.remove(credential.as_bytes())?;
            debug!("Session of {} expired", session.username);
            return Ok(false);
        }
        if session.username != username {
            return Ok(false);
        }
        Ok(match self.get_user(username)? {
            Some(user) => user.account == session.account,
            None => false,
        })
    }

    fn delete_user(&self, username: &str, credential: &str) -> Result<(), IdentityError> {
        let mut tokens = Vec::new();
        for entry in self.sessions.iter() {
            let (token, bytes) = entry?;
            let session: Session = bincode::deserialize(&bytes)?;
            if session.username == username {
                tokens.push(token);
            }
        }
        let now = now_millis();
        (&self.users, &self.sessions).transaction(
            |(users, sessions)| -> ConflictableTransactionResult<(), IdentityError> {
                let session: Option<Session> = match sessions.get(credential.as_bytes())? {
                    Some(bytes) => match bincode::deserialize(&bytes) {
                        Ok(session) => Some(session),
                        Err(err) => return abort(IdentityError::Codec(err)),
                    },
                    None => None,
                };
                let owned = session
                    .map(|session| session.username == username && !session.is_expired(now))
                    .unwrap_or(false);
                if !owned {
                    return abort(IdentityError::BadCredentials);
                }
                if users.remove(username.as_bytes())?.is_none() {
                    return abort(IdentityError::UnknownUser(username.to_owned()));
                }
                for token in &tokens {
                    sessions.remove(token.clone())?;
                }
                Ok(())
            },
        )?;
        info!("Deleted user: {}", username);
        Ok(())
    }
}
