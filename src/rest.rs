//! Track lookups against a node's HTTP API.

use crate::model::{LoadTrackResponse, TrackInfo};
use crate::{Error, Result};
use hyper::client::HttpConnector;
use hyper::header::AUTHORIZATION;
use hyper::{Body, Client, Request, Uri};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tokio::time;

/// A search provider a node can query on behalf of a plain search term.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Source {
    Youtube,
    Soundcloud,
}

impl Source {
    pub fn prefix(&self) -> &'static str {
        match *self {
            Source::Youtube => "ytsearch:",
            Source::Soundcloud => "scsearch:",
        }
    }
}

/// Resolves and decodes tracks through one node.
#[derive(Clone)]
pub struct Resolver {
    client: Client<HttpConnector>,
    url: String,
    auth: String,
    timeout: Duration,
}

impl Resolver {
    pub fn new(url: impl Into<String>, auth: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            auth: auth.into(),
            timeout,
        }
    }

    /// Loads the tracks behind an identifier: a URL, or a search term when a
    /// source is given.
    pub async fn resolve(&self, identifier: &str, source: Option<Source>) -> Result<LoadTrackResponse> {
        let identifier = match source {
            Some(source) => format!("{}{}", source.prefix(), identifier),
            None => identifier.to_owned(),
        };

        self.get(self.load_tracks_uri(&identifier)).await
    }

    /// Decodes a base64 track back into its info.
    pub async fn decode(&self, track: &str) -> Result<TrackInfo> {
        self.get(self.decode_track_uri(track)).await
    }

    fn load_tracks_uri(&self, identifier: &str) -> String {
        format!(
            "{}/loadtracks?identifier={}",
            self.url,
            utf8_percent_encode(identifier, NON_ALPHANUMERIC),
        )
    }

    fn decode_track_uri(&self, track: &str) -> String {
        format!(
            "{}/decodetrack?track={}",
            self.url,
            utf8_percent_encode(track, NON_ALPHANUMERIC),
        )
    }

    async fn get<T: DeserializeOwned>(&self, uri: String) -> Result<T> {
        let uri = uri.parse::<Uri>()?;

        debug!("GET {}", uri);

        let request = Request::get(uri)
            .header(AUTHORIZATION, self.auth.as_str())
            .body(Body::empty())?;

        let fetch = async {
            let response = self.client.request(request).await?;
            let status = response.status();

            if !status.is_success() {
                return Err(Error::RestStatus(status.as_u16()));
            }

            let body = hyper::body::to_bytes(response.into_body()).await?;

            let value = serde_json::from_slice(&body)?;

            Ok::<T, Error>(value)
        };

        match time::timeout(self.timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(Error::RestTimeout),
        }
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}
