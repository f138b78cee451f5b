use crate::model::*;
use crate::watchlist::WatchlistError;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{abort, ConflictableTransactionResult, TransactionalTree};

pub const MOVIES: &[u8] = b"movies";
pub const WATCHLISTS: &[u8] = b"watchlists";

pub type TxResult<T> = ConflictableTransactionResult<T, WatchlistError>;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WatchlistError> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned, V: AsRef<[u8]>>(bytes: V) -> Result<T, WatchlistError> {
    Ok(bincode::deserialize(bytes.as_ref())?)
}

/// Movie records inside a transaction, keyed by movie id.
pub trait MovieStore {
    fn get_movie(&self, id: &str) -> TxResult<Option<MovieRecord>>;
    fn put_movie(&self, movie: &MovieRecord) -> TxResult<()>;
    fn remove_movie(&self, id: &str) -> TxResult<()>;

    /// Adds one reference to the movie, creating its record from `item` if
    /// nothing referenced it yet. Returns the new saved count.
    fn retain_movie(&self, item: &MovieItem) -> TxResult<u64> {
        let movie = match self.get_movie(&item.id)? {
            Some(mut movie) => {
                movie.saved_count += 1;
                movie
            }
            None => MovieRecord::first_save(item),
        };
        self.put_movie(&movie)?;
        Ok(movie.saved_count)
    }

    /// Drops one reference to the movie. The record is deleted once its count
    /// reaches zero. Returns the remaining saved count.
    fn release_movie(&self, id: &str) -> TxResult<u64> {
        let mut movie = match self.get_movie(id)? {
            Some(movie) => movie,
            None => return abort(WatchlistError::MovieNotFound(id.to_owned())),
        };
        movie.saved_count = movie.saved_count.saturating_sub(1);
        if movie.saved_count == 0 {
            self.remove_movie(id)?;
        } else {
            self.put_movie(&movie)?;
        }
        Ok(movie.saved_count)
    }
}

impl MovieStore for TransactionalTree {
    fn get_movie(&self, id: &str) -> TxResult<Option<MovieRecord>> {
        match self.get(id.as_bytes())? {
            Some(bytes) => decode(bytes).map(Some).or_else(abort),
            None => Ok(None),
        }
    }

    fn put_movie(&self, movie: &MovieRecord) -> TxResult<()> {
        let bytes = encode(movie).or_else(abort)?;
        self.insert(movie.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove_movie(&self, id: &str) -> TxResult<()> {
        self.remove(id.as_bytes())?;
        Ok(())
    }
}

/// Watchlist documents inside a transaction, keyed by username.
pub trait WatchlistStore {
    fn get_watchlist(&self, username: &str) -> TxResult<Option<Watchlist>>;
    fn put_watchlist(&self, watchlist: &Watchlist) -> TxResult<()>;
    fn remove_watchlist(&self, username: &str) -> TxResult<()>;

    fn expect_watchlist(&self, username: &str) -> TxResult<Watchlist> {
        match self.get_watchlist(username)? {
            Some(watchlist) => Ok(watchlist),
            None => abort(WatchlistError::WatchlistNotFound(username.to_owned())),
        }
    }
}

impl WatchlistStore for TransactionalTree {
    fn get_watchlist(&self, username: &str) -> TxResult<Option<Watchlist>> {
        match self.get(username.as_bytes())? {
            Some(bytes) => decode(bytes).map(Some).or_else(abort),
            None => Ok(None),
        }
    }

    fn put_watchlist(&self, watchlist: &Watchlist) -> TxResult<()> {
        let bytes = encode(watchlist).or_else(abort)?;
        self.insert(watchlist.username.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove_watchlist(&self, username: &str) -> TxResult<()> {
        self.remove(username.as_bytes())?;
        Ok(())
    }
}
