//! Hasura GraphQL adapter for the graph store.
//!
//! Sends every operation as a `POST {url}/v1/graphql` with the admin secret
//! header and maps the three ways a request can fail onto the core error
//! taxonomy: transport failures (connect, timeout, non-2xx status), GraphQL
//! `errors` arrays, and responses that do not carry the expected data.

use std::{collections::HashSet, fmt, time::Duration};

use chrono::{DateTime, Utc};
use eventide_core::{
    BulkInsertResult, Error, Event, EventHash, EventId, HashTable, LogFields, LogId, NewEvent,
    ProcessingLog, Result, RetryCandidate,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::graph::{GraphFuture, GraphStore};

const GRAPHQL_PATH: &str = "/v1/graphql";
const ADMIN_SECRET_HEADER: &str = "x-hasura-admin-secret";

/// Longest slice of an error response body kept in error messages.
const MAX_ERROR_BODY: usize = 1024;

const EVENT_FIELDS: &str = "id event_type event_created_at event_hash event_data";
const LOG_FIELDS: &str = "id event_id processed_at processed_status processed_result \
                          processed_result_error integration_url integration_request_method \
                          integration_payload";

/// Connection settings for [`HasuraGraphStore`].
#[derive(Clone)]
pub struct HasuraConfig {
    /// Base URL of the Hasura instance; `/v1/graphql` is appended if
    /// missing.
    pub url: String,
    /// Value of the `x-hasura-admin-secret` header.
    pub admin_secret: String,
    /// Timeout applied to every request.
    pub timeout: Duration,
    /// Unique constraint on `event_processed_logs.event_id`. When set, log
    /// inserts carry an `on_conflict` clause so a concurrent second insert
    /// becomes an update.
    pub log_conflict_constraint: Option<String>,
}

impl Default for HasuraConfig {
    fn default() -> Self {
        Self {
            url: "http://hasura:8080".to_string(),
            admin_secret: "admin".to_string(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            log_conflict_constraint: None,
        }
    }
}

impl fmt::Debug for HasuraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HasuraConfig")
            .field("url", &self.url)
            .field("admin_secret", &"***")
            .field("timeout", &self.timeout)
            .field("log_conflict_constraint", &self.log_conflict_constraint)
            .finish()
    }
}

/// Graph store backed by a Hasura GraphQL endpoint.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct HasuraGraphStore {
    client: reqwest::Client,
    endpoint: String,
    admin_secret: String,
    timeout: Duration,
    log_conflict_constraint: Option<String>,
}

impl fmt::Debug for HasuraGraphStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HasuraGraphStore")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("log_conflict_constraint", &self.log_conflict_constraint)
            .finish_non_exhaustive()
    }
}

impl HasuraGraphStore {
    /// Creates a store from connection settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the HTTP client cannot be built.
    pub fn new(config: HasuraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::validation(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: graphql_endpoint(&config.url),
            admin_secret: config.admin_secret,
            timeout: config.timeout,
            log_conflict_constraint: config.log_conflict_constraint,
        })
    }

    /// Returns a store pointed at another endpoint and secret that shares
    /// this store's connection pool and timeout.
    #[must_use]
    pub fn with_credentials(&self, url: &str, admin_secret: impl Into<String>) -> Self {
        Self {
            client: self.client.clone(),
            endpoint: graphql_endpoint(url),
            admin_secret: admin_secret.into(),
            timeout: self.timeout,
            log_conflict_constraint: self.log_conflict_constraint.clone(),
        }
    }

    /// Full GraphQL endpoint requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Executes a GraphQL document and returns its `data` object.
    ///
    /// # Errors
    ///
    /// - `Timeout` or `Transport` if the request fails or returns a non-2xx
    ///   status
    /// - `ConstraintViolation` if a GraphQL error mentions a uniqueness
    ///   violation
    /// - `Graph` for any other GraphQL error
    /// - `MalformedResponse` if the body is not JSON or has no `data`
    pub async fn execute(&self, operation: &str, query: &str, variables: Value) -> Result<Value> {
        let span = info_span!(
            "graph_request",
            operation,
            request_id = %Uuid::new_v4(),
            endpoint = %self.endpoint
        );

        async move {
            tracing::debug!("Executing GraphQL operation");

            let response = self
                .client
                .post(&self.endpoint)
                .header(ADMIN_SECRET_HEADER, &self.admin_secret)
                .json(&json!({ "query": query, "variables": variables }))
                .send()
                .await
                .map_err(|e| self.request_error(&e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(status = status.as_u16(), "Hasura returned error status");
                return Err(Error::http_status(
                    status.as_u16(),
                    format!("HTTP {} from Hasura: {}", status.as_u16(), truncate(&body)),
                ));
            }

            let body: GraphResponse = response
                .json()
                .await
                .map_err(|e| Error::malformed(format!("invalid GraphQL response body: {e}")))?;

            if let Some(errors) = body.errors.filter(|errors| !errors.is_empty()) {
                let error = classify_errors(&errors);
                tracing::warn!(error = %error, "GraphQL operation returned errors");
                return Err(error);
            }

            body.data.ok_or_else(|| Error::malformed("GraphQL response has no data"))
        }
        .instrument(span)
        .await
    }

    fn request_error(&self, err: &reqwest::Error) -> Error {
        if err.is_timeout() {
            tracing::warn!("Timeout connecting to Hasura");
            return Error::timeout(self.timeout.as_secs());
        }
        if err.is_connect() {
            tracing::warn!(error = %err, "Connection error to Hasura");
            return Error::transport(format!(
                "Connection error to Hasura at {}: {err}",
                self.endpoint
            ));
        }
        Error::transport(format!("Unexpected error executing GraphQL query: {err}"))
    }

    async fn hashes_in(
        &self,
        hashes: Vec<EventHash>,
        table: HashTable,
    ) -> Result<HashSet<EventHash>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }

        let root = match table {
            HashTable::Pending => "event_store",
            HashTable::Archive => "completed_integration_events",
        };
        let query = format!(
            "query CheckEventHashes($hashes: [String!]!) {{ \
               {root}(where: {{event_hash: {{_in: $hashes}}}}) {{ event_hash }} \
             }}"
        );

        let mut data = self.execute("CheckEventHashes", &query, json!({ "hashes": hashes })).await?;
        let rows: Vec<HashRow> = take_field(&mut data, root)?;
        Ok(rows.into_iter().map(|row| row.event_hash).collect())
    }

    async fn insert_one(&self, event: NewEvent) -> Result<Event> {
        let query = format!(
            "mutation InsertEvent($eventType: String!, $eventData: jsonb!, $eventHash: String!) {{ \
               insert_event_store_one(object: {{ \
                 event_type: $eventType, event_data: $eventData, event_hash: $eventHash \
               }}) {{ {EVENT_FIELDS} }} \
             }}"
        );
        let variables = json!({
            "eventType": event.event_type,
            "eventData": event.event_data,
            "eventHash": event.event_hash,
        });

        let mut data = self.execute("InsertEvent", &query, variables).await?;
        let inserted: Option<Event> = take_field(&mut data, "insert_event_store_one")?;
        inserted.ok_or_else(|| Error::malformed("Event insertion returned no data"))
    }

    async fn insert_many(&self, events: Vec<NewEvent>) -> Result<BulkInsertResult> {
        let query = format!(
            "mutation BulkInsertEvents($objects: [event_store_insert_input!]!) {{ \
               insert_event_store(objects: $objects) {{ affected_rows returning {{ {EVENT_FIELDS} }} }} \
             }}"
        );

        let mut data =
            self.execute("BulkInsertEvents", &query, json!({ "objects": events })).await?;
        let inserted: Option<BulkInsertResult> = take_field(&mut data, "insert_event_store")?;
        Ok(inserted.unwrap_or_default())
    }

    async fn latest_log(&self, event_id: EventId) -> Result<Option<ProcessingLog>> {
        let query = format!(
            "query GetLatestProcessingLog($eventId: Int!) {{ \
               event_processed_logs(where: {{event_id: {{_eq: $eventId}}}}, \
                                    order_by: {{processed_at: desc}}, limit: 1) {{ {LOG_FIELDS} }} \
             }}"
        );

        let mut data =
            self.execute("GetLatestProcessingLog", &query, json!({ "eventId": event_id })).await?;
        let logs: Vec<ProcessingLog> = take_field(&mut data, "event_processed_logs")?;
        Ok(logs.into_iter().next())
    }

    async fn insert_log_row(&self, fields: LogFields) -> Result<ProcessingLog> {
        let mut variables = log_variables(&fields);
        variables["eventId"] = json!(fields.event_id);

        let (conflict_param, conflict_clause) = match &self.log_conflict_constraint {
            Some(constraint) => {
                variables["constraint"] = json!(constraint);
                (
                    ", $constraint: event_processed_logs_constraint!",
                    ", on_conflict: { constraint: $constraint, update_columns: [processed_at, \
                     processed_status, processed_result, processed_result_error, integration_url, \
                     integration_request_method, integration_payload] }",
                )
            },
            None => ("", ""),
        };

        let query = format!(
            "mutation InsertEventProcessingLog($eventId: Int!, {params}{conflict_param}) {{ \
               insert_event_processed_logs_one(object: {{ event_id: $eventId, {set} }}{conflict_clause}) \
               {{ {LOG_FIELDS} }} \
             }}",
            params = LOG_PARAMS,
            set = LOG_SET,
        );

        let mut data = self.execute("InsertEventProcessingLog", &query, variables).await?;
        let inserted: Option<ProcessingLog> =
            take_field(&mut data, "insert_event_processed_logs_one")?;
        inserted.ok_or_else(|| Error::malformed("Event processing log insertion returned no data"))
    }

    async fn update_log_row(&self, log_id: LogId, fields: LogFields) -> Result<ProcessingLog> {
        let mut variables = log_variables(&fields);
        variables["logId"] = json!(log_id);

        let query = format!(
            "mutation UpdateEventProcessingLog($logId: Int!, {LOG_PARAMS}) {{ \
               update_event_processed_logs_by_pk(pk_columns: {{id: $logId}}, _set: {{ {LOG_SET} }}) \
               {{ {LOG_FIELDS} }} \
             }}"
        );

        let mut data = self.execute("UpdateEventProcessingLog", &query, variables).await?;
        let updated: Option<ProcessingLog> =
            take_field(&mut data, "update_event_processed_logs_by_pk")?;
        updated.ok_or_else(|| Error::not_found(format!("processing log {log_id}")))
    }

    async fn retry_candidates(&self, event_type: String) -> Result<Vec<RetryCandidate>> {
        let query = format!(
            "query GetUnprocessedOrFailedEvents($eventType: String!) {{ \
               event_store( \
                 where: {{ _and: [ \
                   {{ event_type: {{_eq: $eventType}} }}, \
                   {{ _or: [ \
                     {{ event_processed_logs_aggregate: {{ count: {{ predicate: {{_eq: 0}} }} }} }}, \
                     {{ event_processed_logs: {{ processed_status: {{_eq: \"FAILED\"}} }} }} \
                   ] }} \
                 ] }}, \
                 order_by: {{event_created_at: asc}} \
               ) {{ \
                 {EVENT_FIELDS} \
                 event_processed_logs(order_by: {{processed_at: desc}}, limit: 1) {{ {LOG_FIELDS} }} \
               }} \
             }}"
        );

        let mut data =
            self.execute("GetUnprocessedOrFailedEvents", &query, json!({ "eventType": event_type }))
                .await?;
        let rows: Vec<EventWithLogs> = take_field(&mut data, "event_store")?;

        Ok(rows
            .into_iter()
            .map(|row| RetryCandidate {
                event: row.event,
                latest_log: row.event_processed_logs.into_iter().next(),
            })
            .collect())
    }
}

impl GraphStore for HasuraGraphStore {
    fn query_by_hashes(
        &self,
        hashes: Vec<EventHash>,
        table: HashTable,
    ) -> GraphFuture<'_, HashSet<EventHash>> {
        Box::pin(self.hashes_in(hashes, table))
    }

    fn insert_event(&self, event: NewEvent) -> GraphFuture<'_, Event> {
        Box::pin(self.insert_one(event))
    }

    fn bulk_insert_events(&self, events: Vec<NewEvent>) -> GraphFuture<'_, BulkInsertResult> {
        Box::pin(self.insert_many(events))
    }

    fn latest_log_for_event(&self, event_id: EventId) -> GraphFuture<'_, Option<ProcessingLog>> {
        Box::pin(self.latest_log(event_id))
    }

    fn insert_log(&self, fields: LogFields) -> GraphFuture<'_, ProcessingLog> {
        Box::pin(self.insert_log_row(fields))
    }

    fn update_log(&self, log_id: LogId, fields: LogFields) -> GraphFuture<'_, ProcessingLog> {
        Box::pin(self.update_log_row(log_id, fields))
    }

    fn unprocessed_or_failed(&self, event_type: String) -> GraphFuture<'_, Vec<RetryCandidate>> {
        Box::pin(self.retry_candidates(event_type))
    }
}

const LOG_PARAMS: &str = "$processedAt: timestamptz!, $processedStatus: String!, \
                          $processedResult: jsonb!, $processedResultError: String, \
                          $integrationUrl: String, $integrationRequestMethod: String, \
                          $integrationPayload: jsonb";

const LOG_SET: &str = "processed_at: $processedAt, processed_status: $processedStatus, \
                       processed_result: $processedResult, \
                       processed_result_error: $processedResultError, \
                       integration_url: $integrationUrl, \
                       integration_request_method: $integrationRequestMethod, \
                       integration_payload: $integrationPayload";

fn log_variables(fields: &LogFields) -> Value {
    json!({
        "processedAt": timestamp(fields.processed_at),
        "processedStatus": fields.status,
        "processedResult": fields.result,
        "processedResultError": fields.result_error,
        "integrationUrl": fields.integration_url,
        "integrationRequestMethod": fields.integration_method,
        "integrationPayload": fields.integration_payload,
    })
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[derive(Deserialize)]
struct GraphResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct HashRow {
    event_hash: EventHash,
}

#[derive(Deserialize)]
struct EventWithLogs {
    #[serde(flatten)]
    event: Event,
    #[serde(default)]
    event_processed_logs: Vec<ProcessingLog>,
}

/// Appends the GraphQL path to a base URL unless already present.
fn graphql_endpoint(url: &str) -> String {
    if url.ends_with(GRAPHQL_PATH) {
        url.to_string()
    } else {
        format!("{}{GRAPHQL_PATH}", url.trim_end_matches('/'))
    }
}

/// Joins GraphQL error messages and classifies uniqueness violations.
fn classify_errors(errors: &[Value]) -> Error {
    let joined = errors
        .iter()
        .map(|error| match error.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ");

    let lowered = joined.to_lowercase();
    if lowered.contains("unique") || lowered.contains("duplicate") {
        Error::constraint_violation(joined)
    } else {
        Error::graph(format!("GraphQL query failed: {joined}"))
    }
}

/// Removes `name` from a `data` object and deserializes it.
fn take_field<T: DeserializeOwned>(data: &mut Value, name: &str) -> Result<T> {
    let field = data.get_mut(name).map(Value::take).unwrap_or(Value::Null);
    serde_json::from_value(field)
        .map_err(|e| Error::malformed(format!("unexpected shape for {name}: {e}")))
}

fn truncate(body: &str) -> &str {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
