use std::collections::BTreeMap;

use async_trait::async_trait;
use harvest_core::{FieldChoice, Group, Lookup, NormalizedDataset, Organization};
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::{CatalogError, HostCatalog};

/// `{success, result, error}` envelope returned by every CKAN action.
#[derive(Debug, Deserialize)]
struct ActionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: JsonValue,
    #[serde(default)]
    error: Option<ActionErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ActionErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    fields: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct SchemaResult {
    #[serde(default)]
    dataset_fields: Vec<SchemaField>,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    field_name: String,
    #[serde(default)]
    choices: Vec<FieldChoice>,
}

fn parse_envelope<T: DeserializeOwned>(
    action: &str,
    status_ok: bool,
    body: &str,
) -> Result<Lookup<T>, CatalogError> {
    let envelope: ActionResponse = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if !status_ok => {
            return Err(CatalogError::Action {
                action: action.to_string(),
                message: "non-JSON error response".to_string(),
            })
        }
        Err(err) => return Err(err.into()),
    };

    if envelope.success {
        return Ok(Lookup::Found(serde_json::from_value(envelope.result)?));
    }

    let Some(error) = envelope.error else {
        return Err(CatalogError::Action {
            action: action.to_string(),
            message: "unsuccessful response without error body".to_string(),
        });
    };
    match error.kind.as_str() {
        "Not Found Error" => Ok(Lookup::NotFound),
        "Validation Error" => Err(CatalogError::Validation(
            serde_json::to_string(&error.fields).unwrap_or_default(),
        )),
        _ => Err(CatalogError::Action {
            action: action.to_string(),
            message: error.message.unwrap_or(error.kind),
        }),
    }
}

/// CKAN action API client (`/api/3/action/<name>`).
#[derive(Debug, Clone)]
pub struct CkanCatalog {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CkanCatalog {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{action}", self.base_url.trim_end_matches('/'))
    }

    async fn call<T, B>(&self, action: &str, body: &B) -> Result<Lookup<T>, CatalogError>
    where
        T: DeserializeOwned + Send,
        B: Serialize + ?Sized + Sync,
    {
        let span = info_span!("catalog_action", action);
        async move {
            let mut request = self.client.post(self.action_url(action)).json(body);
            if let Some(key) = &self.api_key {
                request = request.header(AUTHORIZATION, key);
            }
            let resp = request.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            debug!(%status, "catalog action returned");
            parse_envelope(action, status.is_success(), &text)
        }
        .instrument(span)
        .await
    }

    async fn call_existing<T, B>(&self, action: &str, body: &B, id: &str) -> Result<T, CatalogError>
    where
        T: DeserializeOwned + Send,
        B: Serialize + ?Sized + Sync,
    {
        self.call(action, body)
            .await?
            .found()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }
}

fn created_id(action: &str, result: &JsonValue) -> Result<String, CatalogError> {
    result
        .get("id")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| CatalogError::Action {
            action: action.to_string(),
            message: "result carries no id".to_string(),
        })
}

#[async_trait]
impl HostCatalog for CkanCatalog {
    async fn package_show(&self, id_or_name: &str) -> Result<Lookup<NormalizedDataset>, CatalogError> {
        self.call("package_show", &json!({ "id": id_or_name })).await
    }

    async fn package_create(&self, dataset: &NormalizedDataset) -> Result<String, CatalogError> {
        let name = dataset.name.clone().unwrap_or_default();
        let result: JsonValue = self.call_existing("package_create", dataset, &name).await?;
        created_id("package_create", &result)
    }

    async fn package_update(&self, dataset: &NormalizedDataset) -> Result<String, CatalogError> {
        let id = dataset.id.clone().unwrap_or_default();
        let result: JsonValue = self.call_existing("package_update", dataset, &id).await?;
        created_id("package_update", &result)
    }

    async fn package_delete(&self, id: &str) -> Result<(), CatalogError> {
        let _: JsonValue = self
            .call_existing("package_delete", &json!({ "id": id }), id)
            .await?;
        Ok(())
    }

    async fn group_show(&self, id_or_name: &str) -> Result<Lookup<Group>, CatalogError> {
        self.call("group_show", &json!({ "id": id_or_name })).await
    }

    async fn group_create(&self, group: &Group) -> Result<Group, CatalogError> {
        self.call_existing("group_create", group, &group.name).await
    }

    async fn organization_show(
        &self,
        id_or_name: &str,
    ) -> Result<Lookup<Organization>, CatalogError> {
        self.call("organization_show", &json!({ "id": id_or_name }))
            .await
    }

    async fn organization_create(&self, org: &Organization) -> Result<Organization, CatalogError> {
        self.call_existing("organization_create", org, &org.name).await
    }

    async fn field_choices(&self, field_name: &str) -> Result<Vec<FieldChoice>, CatalogError> {
        let schema: SchemaResult = self
            .call_existing(
                "scheming_dataset_schema_show",
                &json!({ "type": "dataset" }),
                "dataset schema",
            )
            .await?;
        Ok(schema
            .dataset_fields
            .into_iter()
            .find(|field| field.field_name == field_name)
            .map(|field| field.choices)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_error_becomes_lookup_miss() {
        let body = r#"{"success": false, "error": {"__type": "Not Found Error", "message": "Not found"}}"#;
        let parsed: Lookup<Group> = parse_envelope("group_show", false, body).expect("parsed");
        assert_eq!(parsed, Lookup::NotFound);
    }

    #[test]
    fn validation_error_keeps_field_messages() {
        let body = r#"{"success": false, "error": {"__type": "Validation Error", "name": ["That URL is already in use."]}}"#;
        let err = parse_envelope::<JsonValue>("package_create", false, body).unwrap_err();
        match err {
            CatalogError::Validation(message) => assert!(message.contains("already in use")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn successful_envelope_decodes_result() {
        let body = r#"{"success": true, "result": {"id": "o1", "name": "dept-x", "title": "Dept X", "package_count": 3}}"#;
        let org: Lookup<Organization> = parse_envelope("organization_show", true, body).expect("parsed");
        let org = org.found().expect("org");
        assert_eq!(org.name, "dept-x");
        assert_eq!(org.additional.get("package_count"), Some(&json!(3)));
    }

    #[test]
    fn html_error_pages_are_action_errors() {
        let err = parse_envelope::<JsonValue>("package_show", false, "<html>502</html>").unwrap_err();
        assert!(matches!(err, CatalogError::Action { .. }));
    }

    #[test]
    fn action_url_joins_without_double_slash() {
        let catalog = CkanCatalog::new(reqwest::Client::new(), "https://data.example.gov/", None);
        assert_eq!(
            catalog.action_url("package_show"),
            "https://data.example.gov/api/3/action/package_show"
        );
    }
}
