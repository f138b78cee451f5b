use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A movie as submitted by a client, using the metadata provider's field names.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MovieItem {
    #[serde(rename = "imdbID")]
    pub id: String,
    #[serde(rename = "Title", alias = "title", default)]
    pub title: String,
    #[serde(rename = "Year", alias = "year", default)]
    pub year: String,
    #[serde(rename = "Poster", alias = "poster", default)]
    pub poster: String,
    #[serde(rename = "imdbRating", alias = "rating", default)]
    pub rating: Option<String>,
}

/// Shared record for one movie, referenced by every watchlist that saved it.
///
/// The display fields are copied from the first item saved and never re-synced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MovieRecord {
    #[serde(rename = "imdbID")]
    pub id: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Year")]
    pub year: String,
    #[serde(rename = "Poster")]
    pub poster: String,
    #[serde(rename = "imdbRating")]
    pub rating: Option<String>,
    #[serde(rename = "savedCount")]
    pub saved_count: u64,
}

impl MovieRecord {
    pub fn first_save(item: &MovieItem) -> Self {
        MovieRecord {
            id: item.id.clone(),
            title: item.title.clone(),
            year: item.year.clone(),
            poster: item.poster.clone(),
            rating: item.rating.clone(),
            saved_count: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Watchlist {
    pub username: String,
    pub list: BTreeSet<String>,
    pub length: u64,
}

impl Watchlist {
    pub fn new(username: &str) -> Self {
        Watchlist {
            username: username.to_owned(),
            list: BTreeSet::new(),
            length: 0,
        }
    }

    /// Returns `false` if the movie was already listed.
    pub fn insert(&mut self, movie_id: &str) -> bool {
        let inserted = self.list.insert(movie_id.to_owned());
        if inserted {
            self.length += 1;
        }
        inserted
    }

    /// Returns `false` if the movie was not listed.
    pub fn remove(&mut self, movie_id: &str) -> bool {
        let removed = self.list.remove(movie_id);
        if removed {
            self.length -= 1;
        }
        removed
    }

    pub fn contains(&self, movie_id: &str) -> bool {
        self.list.contains(movie_id)
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    /// Random id of this registration. A name registered again gets a new one.
    pub account: String,
}

/// A signed-in session, keyed by its bearer token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub username: String,
    pub account: String,
    /// Milliseconds since the unix epoch.
    pub expires_at: u64,
}

impl Session {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}
