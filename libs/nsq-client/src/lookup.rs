//! nsqlookupd HTTP queries.
use std::time::Duration;

use futures::future;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

impl Producer {
    fn address(&self) -> String {
        if self.broadcast_address.contains(':') {
            format!("[{}]:{}", self.broadcast_address, self.tcp_port)
        } else {
            format!("{}:{}", self.broadcast_address, self.tcp_port)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Producers {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// nsqlookupd before 1.0 wrapped every body in `{"status_code", "data"}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Body {
    Legacy { data: Producers },
    Current(Producers),
}

impl Body {
    fn into_producers(self) -> Vec<Producer> {
        match self {
            Body::Legacy { data } | Body::Current(data) => data.producers,
        }
    }
}

/// Queries every configured nsqlookupd and merges what they know.
#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    addrs: Vec<String>,
}

impl LookupClient {
    pub fn new(addrs: Vec<String>, timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Lookup(format!("failed to build http client: {e}")))?;
        Ok(Self { http, addrs })
    }

    pub fn addresses(&self) -> &[String] {
        &self.addrs
    }

    /// nsqd `host:port`s that have `topic`
    pub async fn lookup(&self, topic: &str) -> ClientResult<Vec<String>> {
        self.query("lookup", Some(topic)).await
    }

    /// every nsqd the lookupds know about
    pub async fn nodes(&self) -> ClientResult<Vec<String>> {
        self.query("nodes", None).await
    }

    /// Union of all answers, in lookupd order. Fails only if every lookupd failed.
    async fn query(&self, path: &str, topic: Option<&str>) -> ClientResult<Vec<String>> {
        let answers =
            future::join_all(self.addrs.iter().map(|addr| self.query_one(addr, path, topic)))
                .await;

        let mut found = Vec::new();
        let mut answered = false;
        let mut last_err = None;
        for answer in answers {
            match answer {
                Ok(addrs) => {
                    answered = true;
                    for addr in addrs {
                        if !found.contains(&addr) {
                            found.push(addr);
                        }
                    }
                }
                Err(err) => {
                    debug!(?err, "nsqlookupd query failed");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if !answered => Err(err),
            _ => Ok(found),
        }
    }

    async fn query_one(
        &self,
        addr: &str,
        path: &str,
        topic: Option<&str>,
    ) -> ClientResult<Vec<String>> {
        let url = endpoint_url(addr, path);
        let mut req = self.http.get(&url).header("Accept", "application/json");
        if let Some(topic) = topic {
            req = req.query(&[("topic", topic)]);
        }
        trace!(%url, ?topic, "querying nsqlookupd");
        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::Lookup(format!("{url}: {e}")))?;
        // unknown topic
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(ClientError::Lookup(format!(
                "{url}: unexpected status {}",
                resp.status()
            )));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ClientError::Lookup(format!("{url}: {e}")))?;
        parse_producers(&body).map_err(|e| ClientError::Lookup(format!("{url}: {e}")))
    }
}

fn endpoint_url(addr: &str, path: &str) -> String {
    let base = addr.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/{path}")
    } else {
        format!("http://{base}/{path}")
    }
}

fn parse_producers(body: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let body: Body = serde_json::from_slice(body)?;
    Ok(body
        .into_producers()
        .iter()
        .map(Producer::address)
        .collect())
}
