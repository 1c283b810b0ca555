use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::{
    ids::ItemId,
    items::{Item, ItemCreate},
    matching::Match,
    pipeline::{BackfillReport, UpdateReport},
};

use super::{backend::*, errors::AppError};

/// Talks to a running daemon over HTTP.
pub struct AppRemote {
    remote_addr: String,
    client: reqwest::blocking::Client,
}

impl AppRemote {
    pub fn new(addr: &str) -> AppRemote {
        let remote_addr = addr.strip_suffix('/').unwrap_or(addr).to_string();

        AppRemote {
            remote_addr,
            client: reqwest::blocking::Client::new(),
        }
    }

    /// `/api/items/{id}` with the id percent-encoded as one path segment.
    fn item_url(&self, id: &ItemId) -> Result<reqwest::Url, AppError> {
        let mut url = reqwest::Url::parse(&format!("{}/api/items", self.remote_addr))
            .map_err(|err| anyhow::anyhow!("invalid daemon address {}: {err}", self.remote_addr))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("invalid daemon address {}", self.remote_addr))?
            .push(id.as_str());

        Ok(url)
    }

    fn get(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        log::debug!("GET {}{}", self.remote_addr, url);
        self.client.get(format!("{}{}", self.remote_addr, url))
    }

    fn post(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        log::debug!("POST {}{}", self.remote_addr, url);
        self.client.post(format!("{}{}", self.remote_addr, url))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum WebResponse<T> {
    Error { error: String },
    Data(T),
}

fn handle_response<T>(response: reqwest::blocking::Response) -> Result<T, AppError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let text = response.text()?;

    let web_response = serde_json::from_str::<WebResponse<T>>(&text).map_err(|err| {
        log::error!("{err}. tried to parse: {text:?}");
        anyhow::Error::from(err)
    })?;

    match web_response {
        WebResponse::Data(data) => Ok(data),
        WebResponse::Error { error } => Err(match status {
            StatusCode::NOT_FOUND => AppError::NotFound(error),
            StatusCode::BAD_REQUEST => AppError::InvalidArgument(error),
            StatusCode::CONFLICT => AppError::Conflict(error),
            _ => AppError::Other(anyhow::anyhow!(error)),
        }),
    }
}

impl AppBackend for AppRemote {
    fn generate_embedding(&self, id: &ItemId) -> Result<UpdateReport, AppError> {
        let resp = self
            .post("/api/embeddings/generate")
            .json(&json!({ "itemId": id }))
            .send()?;

        handle_response(resp)
    }

    fn backfill_embeddings(&self, request: BackfillRequest) -> Result<BackfillReport, AppError> {
        let resp = self
            .post("/api/embeddings/backfill")
            .json(&request)
            .send()?;

        handle_response(resp)
    }

    fn find_matches(&self, id: &ItemId, k: Option<usize>) -> Result<Vec<Match>, AppError> {
        let resp = self
            .post("/api/matches")
            .json(&json!({ "itemId": id, "k": k }))
            .send()?;

        handle_response(resp)
    }

    fn create_item(&self, item: ItemCreate) -> Result<Item, AppError> {
        let resp = self.post("/api/items").json(&item).send()?;

        handle_response(resp)
    }

    fn get_item(&self, id: &ItemId) -> Result<Item, AppError> {
        let url = self.item_url(id)?;
        log::debug!("GET {url}");
        let resp = self.client.get(url).send()?;

        handle_response(resp)
    }

    fn delete_item(&self, id: &ItemId) -> Result<Item, AppError> {
        let resp = self
            .post("/api/items/delete")
            .json(&json!({ "itemId": id }))
            .send()?;

        handle_response(resp)
    }

    fn notify_item_created(&self, id: &ItemId) -> Result<(), AppError> {
        let resp = self
            .post("/api/events/item_created")
            .json(&json!({ "itemId": id }))
            .send()?;

        handle_response::<serde_json::Value>(resp).map(|_| ())
    }

    fn status(&self) -> Result<CorpusStatus, AppError> {
        let resp = self.get("/api/status").send()?;

        handle_response(resp)
    }
}
