//! Request bodies and query parameters.

use segmint::{GenerateRequest, Role};
use serde::Deserialize;

use super::response::ApiError;

fn default_count() -> u32 {
    1
}

/// Body of `POST /api/id/generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub business_type: String,
    #[serde(default)]
    pub time_key: Option<String>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub include_routing: bool,
    #[serde(default)]
    pub shard_db_count: Option<u32>,
    #[serde(default)]
    pub shard_table_count: Option<u32>,
    #[serde(default)]
    pub custom_step_size: Option<i32>,
    /// 0 = even, 1 = odd; anything else is rejected.
    #[serde(default)]
    pub force_shard_type: Option<i16>,
}

impl GenerateBody {
    pub fn forced_role(&self) -> Result<Option<Role>, ApiError> {
        match self.force_shard_type {
            None => Ok(None),
            Some(code) => Role::from_code(code).map(Some).ok_or_else(|| {
                ApiError::bad_request(format!("force_shard_type must be 0 or 1, got {code}"))
            }),
        }
    }

    /// Routing is computed only when asked for with a usable db count.
    pub fn wants_routing(&self) -> bool {
        self.include_routing && self.shard_db_count.map_or(false, |count| count > 0)
    }

    pub fn into_generate_request(self, forced_role: Option<Role>) -> GenerateRequest {
        GenerateRequest {
            business_type: self.business_type,
            time_key: self.time_key,
            count: self.count,
            forced_role,
            custom_step: self.custom_step_size,
        }
    }
}

/// Query parameters of `GET /api/id/generate/{business_type}`.
#[derive(Debug, Default, Deserialize)]
pub struct GenerateParams {
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub time_key: Option<String>,
    #[serde(default)]
    pub include_routing: bool,
    #[serde(default)]
    pub shard_db_count: Option<u32>,
    #[serde(default)]
    pub shard_table_count: Option<u32>,
    #[serde(default)]
    pub custom_step_size: Option<i32>,
    #[serde(default)]
    pub force_shard_type: Option<i16>,
}

impl GenerateParams {
    pub fn into_body(self, business_type: String) -> GenerateBody {
        GenerateBody {
            business_type,
            time_key: self.time_key,
            count: self.count,
            include_routing: self.include_routing,
            shard_db_count: self.shard_db_count,
            shard_table_count: self.shard_table_count,
            custom_step_size: self.custom_step_size,
            force_shard_type: self.force_shard_type,
        }
    }
}

/// Body of `POST /api/id/admin/step-size/change`.
#[derive(Debug, Deserialize)]
pub struct ChangeStepBody {
    pub business_type: String,
    #[serde(default)]
    pub time_key: Option<String>,
    pub new_step_size: i32,
    #[serde(default)]
    pub preview: bool,
}

/// Body of `POST /api/id/admin/step-size/force-sync`.
#[derive(Debug, Deserialize)]
pub struct ForceSyncBody {
    pub new_step_size: i32,
    #[serde(default)]
    pub preview: bool,
}

/// Query of the step-size report endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct BusinessQuery {
    #[serde(default)]
    pub business_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_body_fills_defaults() {
        let body: GenerateBody = serde_json::from_str(r#"{"business_type":"order"}"#).unwrap();
        assert_eq!(body.count, 1);
        assert_eq!(body.time_key, None);
        assert!(!body.include_routing);
        assert_eq!(body.forced_role().unwrap(), None);
        assert!(!body.wants_routing());
    }

    #[test]
    fn forced_role_validates_codes() {
        let body: GenerateBody =
            serde_json::from_str(r#"{"business_type":"order","force_shard_type":1}"#).unwrap();
        assert_eq!(body.forced_role().unwrap(), Some(Role::Odd));

        let body: GenerateBody =
            serde_json::from_str(r#"{"business_type":"order","force_shard_type":7}"#).unwrap();
        assert!(body.forced_role().is_err());
    }

    #[test]
    fn routing_requires_a_positive_db_count() {
        let body: GenerateBody = serde_json::from_str(
            r#"{"business_type":"order","include_routing":true,"shard_db_count":0}"#,
        )
        .unwrap();
        assert!(!body.wants_routing());

        let body: GenerateBody = serde_json::from_str(
            r#"{"business_type":"order","include_routing":true,"shard_db_count":4}"#,
        )
        .unwrap();
        assert!(body.wants_routing());
    }

    #[test]
    fn query_params_mirror_the_body() {
        let params: GenerateParams =
            serde_json::from_str(r#"{"count":5,"include_routing":true,"shard_db_count":2}"#)
                .unwrap();
        let body = params.into_body("user".into());
        assert_eq!(body.business_type, "user");
        assert_eq!(body.count, 5);
        assert!(body.wants_routing());
    }
}
