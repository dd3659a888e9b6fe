/// PostgREST-style HTTP backend
///
/// Talks to a REST table API (`/rest/v1/<table>`) and its auth endpoint
/// (`/auth/v1/user`), as exposed by Supabase and plain PostgREST deployments.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use outpost_core::{Error, FilterValue, Filters, Record, Result};

use super::{RemoteBackend, Session};

const REPRESENTATION: &str = "return=representation";
const MERGE_DUPLICATES: &str = "return=representation,resolution=merge-duplicates";

/// Error body returned by PostgREST
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    id: String,
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: RwLock<Option<String>>,
    probe_timeout: Duration,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .gzip(true)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: RwLock::new(None),
            probe_timeout: Duration::from_secs(3),
        })
    }

    pub fn with_access_token(self, token: impl Into<String>) -> Self {
        *self.access_token.write() = Some(token.into());
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Replaces the bearer token, e.g. after a sign-in or refresh.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .access_token
            .read()
            .clone()
            .unwrap_or_else(|| self.api_key.clone());
        request
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await.map_err(transport_error)?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }

    async fn rows(&self, request: RequestBuilder) -> Result<Vec<Record>> {
        let response = self.send(request).await?;
        response.json::<Vec<Record>>().await.map_err(transport_error)
    }

    async fn single_row(&self, request: RequestBuilder, context: String) -> Result<Record> {
        self.rows(request)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NotFound(context))
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_decode() {
        Error::Remote(format!("malformed response: {}", err))
    } else {
        Error::NetworkUnavailable(err.to_string())
    }
}

async fn error_from_response(response: Response) -> Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => {
            let mut message = body
                .message
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            if let Some(details) = body.details.filter(|d| !d.is_empty()) {
                message = format!("{} ({})", message, details);
            }
            if let Some(hint) = body.hint.filter(|h| !h.is_empty()) {
                debug!("Backend hint: {}", hint);
            }
            Error::from_remote(body.code.as_deref(), Some(status.as_u16()), &message)
        }
        Err(_) => Error::from_remote(None, Some(status.as_u16()), &format!("{}: {}", status, text)),
    }
}

/// Encodes a filter value in PostgREST query syntax.
fn encode_filter(filter: &FilterValue) -> String {
    match filter {
        FilterValue::Eq(value) => format!("eq.{}", scalar(value)),
        FilterValue::In(values) => {
            let items: Vec<String> = values.iter().map(|v| quote_list_item(&scalar(v))).collect();
            format!("in.({})", items.join(","))
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn quote_list_item(item: &str) -> String {
    if item.contains([',', '(', ')', '"']) {
        format!("\"{}\"", item.replace('"', "\\\""))
    } else {
        item.to_string()
    }
}

fn filter_query(filters: &Filters) -> Vec<(String, String)> {
    let mut query = vec![("select".to_string(), "*".to_string())];
    query.extend(
        filters
            .iter()
            .map(|(field, filter)| (field.clone(), encode_filter(filter))),
    );
    query
}

fn id_query(id: &str) -> [(&'static str, String); 1] {
    [("id", format!("eq.{}", id))]
}

#[async_trait]
impl RemoteBackend for HttpRemote {
    async fn probe(&self) -> Result<()> {
        let request = self
            .client
            .get(format!("{}/rest/v1/", self.base_url))
            .timeout(self.probe_timeout);
        let response = self.authorize(request).send().await.map_err(transport_error)?;

        // Any answer below 500 proves the backend is reachable.
        if response.status().is_server_error() {
            Err(Error::NetworkUnavailable(format!(
                "backend answered {}",
                response.status()
            )))
        } else {
            Ok(())
        }
    }

    async fn session(&self) -> Result<Option<Session>> {
        let token = match self.access_token.read().clone() {
            Some(token) => token,
            None => return Ok(None),
        };

        let response = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status if status.is_success() => {
                let user: UserBody = response.json().await.map_err(transport_error)?;
                Ok(Some(Session::new(user.id)))
            }
            _ => Err(error_from_response(response).await),
        }
    }

    async fn select(&self, table: &str, filters: &Filters) -> Result<Vec<Record>> {
        let request = self.client.get(self.table_url(table)).query(&filter_query(filters));
        self.rows(request).await
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let request = self
            .client
            .get(self.table_url(table))
            .query(&[("select", "*")])
            .query(&id_query(id));
        Ok(self.rows(request).await?.into_iter().next())
    }

    async fn insert(&self, table: &str, record: Record) -> Result<Record> {
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", REPRESENTATION)
            .json(&[record]);
        self.single_row(request, format!("{} insert returned no row", table))
            .await
    }

    async fn upsert(&self, table: &str, record: Record) -> Result<Record> {
        let request = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", "id")])
            .header("Prefer", MERGE_DUPLICATES)
            .json(&[record]);
        self.single_row(request, format!("{} upsert returned no row", table))
            .await
    }

    async fn update(&self, table: &str, id: &str, patch: Record) -> Result<Record> {
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&id_query(id))
            .header("Prefer", REPRESENTATION)
            .json(&patch);
        self.single_row(request, format!("{}/{}", table, id)).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.table_url(table))
            .query(&id_query(id))
            .header("Prefer", REPRESENTATION);
        self.single_row(request, format!("{}/{}", table, id))
            .await
            .map(|_| ())
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_encode_filters() {
        let filters = Filters::new()
            .eq("class_id", "c1")
            .in_set("status", ["paid", "a,b"]);
        let query = filter_query(&filters);
        assert_eq!(query[0], ("select".to_string(), "*".to_string()));
        assert!(query.contains(&("class_id".to_string(), "eq.c1".to_string())));
        assert!(query.contains(&("status".to_string(), "in.(paid,\"a,b\")".to_string())));
    }

    #[tokio::test]
    async fn test_select_with_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/fees"))
            .and(query_param("student_id", "eq.s1"))
            .and(header("apikey", "anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "f1", "student_id": "s1", "amount": 100}
            ])))
            .mount(&server)
            .await;

        let remote = HttpRemote::new(server.uri(), "anon").unwrap();
        let rows = remote
            .select("fees", &Filters::new().eq("student_id", "s1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["amount"], 100);
    }

    #[tokio::test]
    async fn test_upsert_sends_merge_preference() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/fees"))
            .and(query_param("on_conflict", "id"))
            .and(header_exists("Prefer"))
            .and(body_json(json!([{"id": "f1", "amount": 100}])))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!([{"id": "f1", "amount": 100}])),
            )
            .mount(&server)
            .await;

        let remote = HttpRemote::new(server.uri(), "anon").unwrap();
        let record = outpost_core::into_record(json!({"id": "f1", "amount": 100})).unwrap();
        let saved = remote.upsert("fees", record).await.unwrap();
        assert_eq!(saved["id"], "f1");
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/students"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": "PGRST204",
                "message": "Could not find the 'nickname' column of 'students' in the schema cache",
                "details": null,
                "hint": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/students"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let remote = HttpRemote::new(server.uri(), "anon").unwrap();
        let record = outpost_core::into_record(json!({"id": "s1", "nickname": "x"})).unwrap();
        match remote.insert("students", record.clone()).await {
            Err(Error::SchemaMismatch { field, .. }) => assert_eq!(field, "nickname"),
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(matches!(
            remote.update("students", "s1", record).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_without_token_is_signed_out() {
        let remote = HttpRemote::new("http://127.0.0.1:9", "anon").unwrap();
        assert!(remote.session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        let remote = HttpRemote::new("http://127.0.0.1:9", "anon")
            .unwrap()
            .with_probe_timeout(Duration::from_millis(200));
        assert!(matches!(
            remote.probe().await,
            Err(Error::NetworkUnavailable(_))
        ));
    }
}
