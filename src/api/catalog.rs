//! The single service and plan this broker offers, and validation of its parameters.

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::BrokerError;
use crate::models::{Api, DesiredSpec};

pub const SERVICE_ID: &str = "460F28F9-4D05-4889-970A-6BF5FB7D3CF8";
pub const SERVICE_NAME: &str = "wso2apim-service";
pub const SERVICE_DESCRIPTION: &str = "Manages WSO2 API Manager artifacts";
pub const PLAN_ID: &str = "00e851cd-ce8b-43eb-bc27-ac4d4fbb3204";
pub const PLAN_NAME: &str = "app";
pub const PLAN_DESCRIPTION: &str =
    "Creates an Application with a set of subscription for a given set of APIs in WSO2 API Manager";

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plan_updateable: bool,
    pub tags: Vec<String>,
    pub plans: Vec<Plan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub free: bool,
    pub schemas: Value,
}

pub fn catalog() -> Catalog {
    Catalog {
        services: vec![Service {
            id: SERVICE_ID.into(),
            name: SERVICE_NAME.into(),
            description: SERVICE_DESCRIPTION.into(),
            bindable: true,
            plan_updateable: true,
            tags: vec!["wso2".into(), "apim".into()],
            plans: vec![Plan {
                id: PLAN_ID.into(),
                name: PLAN_NAME.into(),
                description: PLAN_DESCRIPTION.into(),
                bindable: true,
                free: true,
                schemas: json!({
                    "service_instance": {
                        "create": { "parameters": parameter_schema() },
                        "update": { "parameters": parameter_schema() }
                    },
                    "service_binding": {
                        "create": { "parameters": { "$schema": "http://json-schema.org/draft-04/schema#" } }
                    }
                }),
            }],
        }],
    }
}

/// Schema of provision and update parameters: `{"apis": [{"name", "version"}]}`.
pub fn parameter_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-04/schema#",
        "type": "object",
        "properties": {
            "apis": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "minLength": 1 },
                        "version": { "type": "string", "minLength": 1 }
                    },
                    "required": ["name", "version"]
                }
            }
        },
        "required": ["apis"]
    })
}

#[derive(Debug, Deserialize)]
struct ServiceParams {
    apis: Vec<Api>,
}

/// Compiled parameter schema, built once at start-up.
pub struct ParameterValidator {
    schema: JSONSchema,
}

impl ParameterValidator {
    pub fn new() -> anyhow::Result<Self> {
        let raw = parameter_schema();
        let schema = JSONSchema::compile(&raw)
            .map_err(|e| anyhow::anyhow!("invalid parameter schema: {}", e))?;
        Ok(Self { schema })
    }

    /// Validate raw request parameters and turn them into a desired API set.
    pub fn desired_spec(&self, parameters: Option<&Value>) -> Result<DesiredSpec, BrokerError> {
        let parameters = parameters.ok_or_else(|| {
            BrokerError::InvalidParameters("parameters are required".into())
        })?;

        if let Err(errors) = self.schema.validate(parameters) {
            let details: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(BrokerError::InvalidParameters(details.join("; ")));
        }

        let params: ServiceParams = serde_json::from_value(parameters.clone())
            .map_err(|e| BrokerError::InvalidParameters(e.to_string()))?;
        Ok(DesiredSpec::new(params.apis))
    }
}
