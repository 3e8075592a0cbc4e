use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use super::Node;
use crate::{
    error::{Error, Result},
    model::{LoadResult, RoutePlannerStatus, Track, TrackInfo},
};

impl Node {
    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&self.config.rest_url())?.join(path)?)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .header("Authorization", &self.config.password)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Authentication {
                host: self.address(),
                status: response.status().as_u16(),
            }),
            _ => Ok(response),
        }
    }

    /// Resolves an identifier: a URL or a search like `ytsearch:query`.
    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let mut url = self.endpoint("/loadtracks")?;
        url.set_query(Some(&format!("identifier={}", urlencoding::encode(identifier))));

        debug!("Loading tracks from {}: {}", self.address(), identifier);

        let response = self.execute(self.http.get(url)).await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<TrackInfo> {
        let mut url = self.endpoint("/decodetrack")?;
        url.set_query(Some(&format!("track={}", urlencoding::encode(encoded))));

        let response = self.execute(self.http.get(url)).await?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let url = self.endpoint("/decodetracks")?;

        let response = self.execute(self.http.post(url).json(encoded)).await?;
        Ok(response.error_for_status()?.json().await?)
    }

    /// Route planner state, `None` when the node has no route planner.
    pub async fn route_planner_status(&self) -> Result<Option<RoutePlannerStatus>> {
        let url = self.endpoint("/routeplanner/status")?;

        let response = self.execute(self.http.get(url)).await?;
        if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
            return Ok(None);
        }

        let status: RoutePlannerStatus = response.error_for_status()?.json().await?;
        Ok(status.class.is_some().then_some(status))
    }

    /// Unmarks a failing address. Returns `false` when the node has no route
    /// planner.
    pub async fn route_planner_free_address(&self, address: &str) -> Result<bool> {
        let url = self.endpoint("/routeplanner/free/address")?;

        let response = self
            .execute(self.http.post(url).json(&json!({ "address": address })))
            .await?;
        route_planner_outcome(self, response)
    }

    /// Unmarks every failing address. Returns `false` when the node has no
    /// route planner.
    pub async fn route_planner_free_all(&self) -> Result<bool> {
        let url = self.endpoint("/routeplanner/free/all")?;

        let response = self.execute(self.http.post(url)).await?;
        route_planner_outcome(self, response)
    }
}

fn route_planner_outcome(node: &Node, response: Response) -> Result<bool> {
    if response.status() == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("Node {} has no route planner configured", node.address());
        return Ok(false);
    }

    response.error_for_status()?;
    Ok(true)
}
