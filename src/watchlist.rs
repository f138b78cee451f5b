//! Watchlists and the shared movie records they reference.
//!
//! Every mutation runs as one sled transaction over the `watchlists` and
//! `movies` trees, so a movie's `savedCount` always equals the number of
//! watchlists listing it. sled reruns a transaction that conflicts with a
//! concurrent one; each attempt checks the operation's deadline when it starts
//! and again before it commits, and aborts with [`WatchlistError::Timeout`]
//! once it has passed.

use crate::database::*;
use crate::identity::{IdentityError, IdentityProvider};
use crate::model::*;
use log::{debug, info, warn};
use sled::transaction::{abort, TransactionError};
use sled::Transactional;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchlistError {
    #[error("This user already has a watchlist: {0}")]
    AlreadyExists(String),

    #[error("Watchlist not found for user: {0}")]
    WatchlistNotFound(String),

    #[error("{movie_id} is not on the watchlist of {username}")]
    NotInWatchlist { username: String, movie_id: String },

    #[error("Movie record not found: {0}")]
    MovieNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("Transaction timed out")]
    Timeout,

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Corrupt document: {0}")]
    Codec(#[from] bincode::Error),
}

impl From<TransactionError<WatchlistError>> for WatchlistError {
    fn from(err: TransactionError<WatchlistError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => WatchlistError::Storage(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Added {
    Inserted { saved_count: u64 },
    AlreadyListed,
}

/// What deleting a watchlist did to the movie records it referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub movies: usize,
    pub purged: usize,
}

/// Outcome of deleting an account. The local deletion has committed; the
/// identity deletion that follows it may still have failed.
#[derive(Debug)]
pub struct AccountDeletion {
    pub released: Released,
    pub identity: Result<(), IdentityError>,
}

fn before(deadline: Instant) -> TxResult<()> {
    if Instant::now() >= deadline {
        abort(WatchlistError::Timeout)
    } else {
        Ok(())
    }
}

/// Last step of a mutating attempt: hands back `value` to commit, or aborts if
/// the deadline passed while the attempt ran.
fn within<T>(deadline: Instant, value: T) -> TxResult<T> {
    before(deadline)?;
    Ok(value)
}

pub struct Watchlists {
    movies: sled::Tree,
    watchlists: sled::Tree,
    timeout: Duration,
}

impl Watchlists {
    pub fn open(db: &sled::Db, timeout: Duration) -> sled::Result<Self> {
        Ok(Watchlists {
            movies: db.open_tree(MOVIES)?,
            watchlists: db.open_tree(WATCHLISTS)?,
            timeout,
        })
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    pub fn create(&self, username: &str) -> Result<(), WatchlistError> {
        if username.is_empty() {
            return Err(WatchlistError::InvalidRequest("username must not be empty"));
        }
        let watchlist = encode(&Watchlist::new(username))?;
        self.watchlists
            .compare_and_swap(username.as_bytes(), None as Option<&[u8]>, Some(watchlist))?
            .map_err(|_| WatchlistError::AlreadyExists(username.to_owned()))?;
        info!("Watchlist created for user: {}", username);
        Ok(())
    }

    /// Lists `item` on the user's watchlist. Adding a movie that is already
    /// listed changes nothing.
    pub fn add(&self, username: &str, item: &MovieItem) -> Result<Added, WatchlistError> {
        if item.id.is_empty() {
            return Err(WatchlistError::InvalidRequest("movie id must not be empty"));
        }
        let deadline = self.deadline();
        let added = (&self.watchlists, &self.movies).transaction(
            |(watchlists, movies)| -> TxResult<Added> {
                before(deadline)?;
                let mut watchlist = watchlists.expect_watchlist(username)?;
                if !watchlist.insert(&item.id) {
                    return Ok(Added::AlreadyListed);
                }
                let saved_count = movies.retain_movie(item)?;
                watchlists.put_watchlist(&watchlist)?;
                within(deadline, Added::Inserted { saved_count })
            },
        )?;
        match added {
            Added::Inserted { saved_count } => info!(
                "Added {} to {}'s watchlist (saved by {})",
                item.id, username, saved_count
            ),
            Added::AlreadyListed => debug!("{} already on {}'s watchlist", item.id, username),
        }
        Ok(added)
    }

    /// Unlists the movie and returns how many watchlists still reference it.
    /// A return of zero means its record was deleted.
    pub fn remove(&self, username: &str, movie_id: &str) -> Result<u64, WatchlistError> {
        let deadline = self.deadline();
        let remaining = (&self.watchlists, &self.movies).transaction(
            |(watchlists, movies)| -> TxResult<u64> {
                before(deadline)?;
                let mut watchlist = watchlists.expect_watchlist(username)?;
                if !watchlist.remove(movie_id) {
                    return abort(WatchlistError::NotInWatchlist {
                        username: username.to_owned(),
                        movie_id: movie_id.to_owned(),
                    });
                }
                let remaining = movies.release_movie(movie_id)?;
                watchlists.put_watchlist(&watchlist)?;
                within(deadline, remaining)
            },
        )?;
        info!("Removed {} from {}'s watchlist", movie_id, username);
        if remaining == 0 {
            debug!("Movie record {} removed, no watchlist references it", movie_id);
        }
        Ok(remaining)
    }

    pub fn contains(&self, username: &str, movie_id: &str) -> Result<bool, WatchlistError> {
        match self.watchlists.get(username.as_bytes())? {
            Some(bytes) => Ok(decode::<Watchlist, _>(bytes)?.contains(movie_id)),
            None => Err(WatchlistError::WatchlistNotFound(username.to_owned())),
        }
    }

    /// Movie records of the user's watchlist in movie id order, read from one
    /// consistent snapshot of both trees.
    pub fn get(&self, username: &str) -> Result<Vec<MovieRecord>, WatchlistError> {
        let deadline = self.deadline();
        let records = (&self.watchlists, &self.movies).transaction(
            |(watchlists, movies)| -> TxResult<Vec<MovieRecord>> {
                before(deadline)?;
                let watchlist = watchlists.expect_watchlist(username)?;
                let mut records = Vec::with_capacity(watchlist.list.len());
                for id in &watchlist.list {
                    match movies.get_movie(id)? {
                        Some(record) => records.push(record),
                        None => warn!("{}'s watchlist lists {} without a record", username, id),
                    }
                }
                Ok(records)
            },
        )?;
        Ok(records)
    }

    /// The `n` most saved movies. Equal counts are ordered by movie id.
    pub fn most_saved(&self, n: usize) -> Result<Vec<MovieRecord>, WatchlistError> {
        let mut movies = self
            .movies
            .iter()
            .values()
            .map(|bytes| -> Result<MovieRecord, WatchlistError> { decode(bytes?) })
            .collect::<Result<Vec<_>, _>>()?;
        movies.sort_by(|a, b| {
            b.saved_count
                .cmp(&a.saved_count)
                .then_with(|| a.id.cmp(&b.id))
        });
        movies.truncate(n);
        Ok(movies)
    }

    /// Deletes the user's watchlist and releases every movie it listed.
    pub fn delete(&self, username: &str) -> Result<Released, WatchlistError> {
        let deadline = self.deadline();
        let released = (&self.watchlists, &self.movies).transaction(
            |(watchlists, movies)| -> TxResult<Released> {
                before(deadline)?;
                let watchlist = watchlists.expect_watchlist(username)?;
                let mut purged = 0;
                for id in &watchlist.list {
                    if movies.release_movie(id)? == 0 {
                        purged += 1;
                    }
                }
                watchlists.remove_watchlist(username)?;
                within(
                    deadline,
                    Released {
                        movies: watchlist.list.len(),
                        purged,
                    },
                )
            },
        )?;
        info!(
            "Deleted watchlist of {} ({} movies released, {} records purged)",
            username, released.movies, released.purged
        );
        Ok(released)
    }

    /// Deletes the watchlist, then asks the identity provider to delete the
    /// user. The second step only runs after the first has committed and its
    /// failure does not undo it.
    pub fn delete_account(
        &self,
        identity: &dyn IdentityProvider,
        username: &str,
        credential: &str,
    ) -> Result<AccountDeletion, WatchlistError> {
        let released = self.delete(username)?;
        let identity = identity.delete_user(username, credential);
        match &identity {
            Ok(()) => info!("Deleted account of {}", username),
            Err(err) => warn!(
                "Watchlist of {} deleted but the identity was not: {}",
                username, err
            ),
        }
        Ok(AccountDeletion { released, identity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    fn open() -> (sled::Db, Watchlists) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let watchlists = Watchlists::open(&db, Duration::from_secs(60)).unwrap();
        (db, watchlists)
    }

    fn item(id: &str) -> MovieItem {
        MovieItem {
            id: id.to_owned(),
            title: "X".to_owned(),
            year: "2001".to_owned(),
            poster: "https://example.com/poster.jpg".to_owned(),
            rating: None,
        }
    }

    fn movie(db: &sled::Db, id: &str) -> Option<MovieRecord> {
        db.open_tree(MOVIES)
            .unwrap()
            .get(id)
            .unwrap()
            .map(|bytes| decode(bytes).unwrap())
    }

    fn watchlist(db: &sled::Db, username: &str) -> Option<Watchlist> {
        db.open_tree(WATCHLISTS)
            .unwrap()
            .get(username)
            .unwrap()
            .map(|bytes| decode(bytes).unwrap())
    }

    /// Recounts every reference and compares against the stored counters.
    fn assert_consistent(db: &sled::Db) {
        let mut references: HashMap<String, u64> = HashMap::new();
        for entry in db.open_tree(WATCHLISTS).unwrap().iter().values() {
            let watchlist: Watchlist = decode(entry.unwrap()).unwrap();
            assert_eq!(watchlist.length as usize, watchlist.list.len());
            for id in watchlist.list {
                *references.entry(id).or_insert(0) += 1;
            }
        }
        let mut counted: HashMap<String, u64> = HashMap::new();
        for entry in db.open_tree(MOVIES).unwrap().iter().values() {
            let record: MovieRecord = decode(entry.unwrap()).unwrap();
            assert!(record.saved_count > 0);
            counted.insert(record.id, record.saved_count);
        }
        assert_eq!(references, counted);
    }

    #[test]
    fn create_twice_fails() {
        let (_db, watchlists) = open();
        watchlists.create("alice").unwrap();
        match watchlists.create("alice") {
            Err(WatchlistError::AlreadyExists(username)) => assert_eq!(username, "alice"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn first_add_creates_record() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        let added = watchlists.add("alice", &item("tt001")).unwrap();
        assert_eq!(added, Added::Inserted { saved_count: 1 });

        let record = movie(&db, "tt001").unwrap();
        assert_eq!(record.saved_count, 1);
        assert_eq!(record.title, "X");
        let alice = watchlist(&db, "alice").unwrap();
        assert_eq!(alice.length, 1);
        assert!(alice.contains("tt001"));
        assert_consistent(&db);
    }

    #[test]
    fn duplicate_add_counts_once() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        watchlists.add("alice", &item("tt001")).unwrap();
        let again = watchlists.add("alice", &item("tt001")).unwrap();
        assert_eq!(again, Added::AlreadyListed);
        assert_eq!(movie(&db, "tt001").unwrap().saved_count, 1);
        assert_eq!(watchlist(&db, "alice").unwrap().length, 1);
        assert_consistent(&db);
    }

    #[test]
    fn add_without_watchlist_writes_nothing() {
        let (db, watchlists) = open();
        match watchlists.add("nobody", &item("tt001")) {
            Err(WatchlistError::WatchlistNotFound(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(movie(&db, "tt001").is_none());
    }

    #[test]
    fn add_rejects_empty_id() {
        let (_db, watchlists) = open();
        watchlists.create("alice").unwrap();
        assert!(matches!(
            watchlists.add("alice", &item("")),
            Err(WatchlistError::InvalidRequest(_))
        ));
    }

    #[test]
    fn shared_movie_survives_partial_removal() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        watchlists.create("bob").unwrap();
        watchlists.add("alice", &item("tt001")).unwrap();
        let added = watchlists.add("bob", &item("tt001")).unwrap();
        assert_eq!(added, Added::Inserted { saved_count: 2 });

        assert_eq!(watchlists.remove("alice", "tt001").unwrap(), 1);
        assert_eq!(movie(&db, "tt001").unwrap().saved_count, 1);
        let alice = watchlist(&db, "alice").unwrap();
        assert!(alice.list.is_empty());
        assert_eq!(alice.length, 0);

        let top = watchlists.most_saved(1).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id, "tt001");
        assert_consistent(&db);
    }

    #[test]
    fn last_removal_deletes_record() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        watchlists.add("alice", &item("tt001")).unwrap();
        assert_eq!(watchlists.remove("alice", "tt001").unwrap(), 0);
        assert!(movie(&db, "tt001").is_none());
        assert_consistent(&db);
    }

    #[test]
    fn removing_unlisted_movie_changes_nothing() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        watchlists.create("bob").unwrap();
        watchlists.add("bob", &item("tt001")).unwrap();
        let checksum = db.checksum().unwrap();

        match watchlists.remove("alice", "tt001") {
            Err(WatchlistError::NotInWatchlist { username, movie_id }) => {
                assert_eq!(username, "alice");
                assert_eq!(movie_id, "tt001");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(checksum, db.checksum().unwrap());
        assert_eq!(movie(&db, "tt001").unwrap().saved_count, 1);
    }

    #[test]
    fn missing_record_aborts_removal() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        watchlists.add("alice", &item("tt001")).unwrap();
        db.open_tree(MOVIES).unwrap().remove("tt001").unwrap();

        assert!(matches!(
            watchlists.remove("alice", "tt001"),
            Err(WatchlistError::MovieNotFound(_))
        ));
        assert!(watchlist(&db, "alice").unwrap().contains("tt001"));
    }

    #[test]
    fn expired_deadline_commits_nothing() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let watchlists = Watchlists::open(&db, Duration::from_secs(0)).unwrap();
        watchlists.create("alice").unwrap();
        assert!(matches!(
            watchlists.add("alice", &item("tt001")),
            Err(WatchlistError::Timeout)
        ));
        assert!(movie(&db, "tt001").is_none());
        assert_eq!(watchlist(&db, "alice").unwrap().length, 0);
    }

    #[test]
    fn attempt_finishing_past_deadline_commits_nothing() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        let deadline = Instant::now() + Duration::from_millis(20);
        let result = (&watchlists.watchlists, &watchlists.movies).transaction(
            |(lists, movies)| -> TxResult<()> {
                before(deadline)?;
                let mut watchlist = lists.expect_watchlist("alice")?;
                watchlist.insert("tt001");
                movies.retain_movie(&item("tt001"))?;
                lists.put_watchlist(&watchlist)?;
                thread::sleep(Duration::from_millis(40));
                within(deadline, ())
            },
        );
        assert!(matches!(
            WatchlistError::from(result.unwrap_err()),
            WatchlistError::Timeout
        ));
        assert!(movie(&db, "tt001").is_none());
        assert_eq!(watchlist(&db, "alice").unwrap().length, 0);
        assert_consistent(&db);
    }

    #[test]
    fn contains_and_get() {
        let (_db, watchlists) = open();
        watchlists.create("alice").unwrap();
        watchlists.add("alice", &item("tt002")).unwrap();
        watchlists.add("alice", &item("tt001")).unwrap();

        assert!(watchlists.contains("alice", "tt001").unwrap());
        assert!(!watchlists.contains("alice", "tt003").unwrap());
        assert!(matches!(
            watchlists.contains("bob", "tt001"),
            Err(WatchlistError::WatchlistNotFound(_))
        ));

        let ids: Vec<_> = watchlists
            .get("alice")
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["tt001", "tt002"]);
        assert!(matches!(
            watchlists.get("bob"),
            Err(WatchlistError::WatchlistNotFound(_))
        ));
    }

    #[test]
    fn most_saved_breaks_ties_by_id() {
        let (_db, watchlists) = open();
        for user in &["alice", "bob", "carol"] {
            watchlists.create(user).unwrap();
        }
        watchlists.add("alice", &item("tt003")).unwrap();
        watchlists.add("alice", &item("tt002")).unwrap();
        watchlists.add("bob", &item("tt002")).unwrap();
        watchlists.add("carol", &item("tt001")).unwrap();

        let top: Vec<_> = watchlists
            .most_saved(10)
            .unwrap()
            .into_iter()
            .map(|record| (record.id, record.saved_count))
            .collect();
        assert_eq!(
            top,
            vec![
                ("tt002".to_owned(), 2),
                ("tt001".to_owned(), 1),
                ("tt003".to_owned(), 1)
            ]
        );
        assert_eq!(watchlists.most_saved(2).unwrap().len(), 2);
        assert!(watchlists.most_saved(0).unwrap().is_empty());
    }

    #[test]
    fn delete_releases_every_movie() {
        let (db, watchlists) = open();
        watchlists.create("alice").unwrap();
        watchlists.create("bob").unwrap();
        watchlists.add("alice", &item("tt001")).unwrap();
        watchlists.add("alice", &item("tt002")).unwrap();
        watchlists.add("bob", &item("tt002")).unwrap();

        let released = watchlists.delete("alice").unwrap();
        assert_eq!(
            released,
            Released {
                movies: 2,
                purged: 1
            }
        );
        assert!(watchlist(&db, "alice").is_none());
        assert!(movie(&db, "tt001").is_none());
        assert_eq!(movie(&db, "tt002").unwrap().saved_count, 1);
        assert_consistent(&db);
    }

    #[test]
    fn failed_identity_deletion_keeps_local_deletion() {
        let (db, watchlists) = open();
        let identity = LocalIdentity::open(&db, 4, Duration::from_secs(60)).unwrap();
        identity.register("alice", "secret").unwrap();
        watchlists.create("alice").unwrap();
        watchlists.add("alice", &item("tt001")).unwrap();

        let deletion = watchlists
            .delete_account(&identity, "alice", "not-a-token")
            .unwrap();
        assert!(deletion.identity.is_err());
        assert!(watchlist(&db, "alice").is_none());
        assert!(movie(&db, "tt001").is_none());
        assert!(identity.is_user("alice").unwrap());
    }

    #[test]
    fn delete_account_removes_identity() {
        let (db, watchlists) = open();
        let identity = LocalIdentity::open(&db, 4, Duration::from_secs(60)).unwrap();
        identity.register("alice", "secret").unwrap();
        let token = identity.sign_in("alice", "secret").unwrap();
        watchlists.create("alice").unwrap();

        let deletion = watchlists.delete_account(&identity, "alice", &token).unwrap();
        assert!(deletion.identity.is_ok());
        assert!(!identity.is_user("alice").unwrap());
        assert!(!identity.verify("alice", &token).unwrap());
    }

    #[test]
    fn concurrent_mutations_keep_counts() {
        let (db, watchlists) = open();
        let watchlists = Arc::new(watchlists);
        let users: Vec<String> = (0..4).map(|i| format!("user{}", i)).collect();
        for user in &users {
            watchlists.create(user).unwrap();
        }

        let handles: Vec<_> = users
            .into_iter()
            .map(|user| {
                let watchlists = watchlists.clone();
                thread::spawn(move || {
                    for round in 0..20 {
                        for id in &["tt001", "tt002", "tt003"] {
                            watchlists.add(&user, &item(id)).unwrap();
                            if round % 2 == 0 {
                                watchlists.remove(&user, id).unwrap();
                            }
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_consistent(&db);
        assert_eq!(movie(&db, "tt001").unwrap().saved_count, 4);
    }
}
