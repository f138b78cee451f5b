//! Proxy for the OMDB movie metadata API.
//!
//! Bodies are passed through untouched. OMDB answers lookups it cannot
//! satisfy with `200 OK` and an `Error` field, which is turned into a
//! `400` here so clients can tell a miss from a hit.

use log::{debug, warn};
use reqwest::Client;
use serde_json::{json, Value};

pub struct Lookup {
    pub status: u16,
    pub body: Value,
}

impl Lookup {
    fn from_body(body: Value) -> Self {
        let status = if body.get("Error").is_some() { 400 } else { 200 };
        Lookup { status, body }
    }

    fn failed(message: &str) -> Self {
        Lookup {
            status: 500,
            body: json!({ "Error": message }),
        }
    }
}

pub struct Omdb {
    client: Client,
    url: String,
    api_key: String,
}

impl Omdb {
    pub fn new(url: &str, api_key: &str) -> Self {
        Omdb {
            client: Client::new(),
            url: url.to_owned(),
            api_key: api_key.to_owned(),
        }
    }

    pub async fn search(&self, title: &str, page: u32) -> Lookup {
        let page = page.to_string();
        match self.get(&[("s", title), ("page", &page)]).await {
            Ok(body) => Lookup::from_body(body),
            Err(err) => {
                warn!("Movie search failed: {}", err);
                Lookup::failed("Search server error")
            }
        }
    }

    pub async fn title(&self, movie_id: &str, plot: &str) -> Lookup {
        match self.get(&[("i", movie_id), ("plot", plot)]).await {
            Ok(body) => Lookup::from_body(body),
            Err(err) => {
                warn!("Movie lookup failed: {}", err);
                Lookup::failed("Movie server error")
            }
        }
    }

    async fn get(&self, query: &[(&str, &str)]) -> reqwest::Result<Value> {
        debug!("OMDB request: {:?}", query);
        self.client
            .get(&self.url)
            .query(query)
            .query(&[("apikey", &self.api_key)])
            .send()
            .await?
            .json()
            .await
    }
}
