use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flowcore::{NodeError, Value};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Authentication strategy of an HTTP node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Bearer,
    #[serde(alias = "apikey", alias = "api-key")]
    ApiKey,
    /// Reserved; rejected by validation.
    #[serde(alias = "oauth")]
    Oauth2,
    /// Reserved; rejected by validation.
    Custom,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::Basic => "basic",
            AuthType::Bearer => "bearer",
            AuthType::ApiKey => "api_key",
            AuthType::Oauth2 => "oauth2",
            AuthType::Custom => "custom",
        }
    }
}

/// Credential fields of an HTTP node config. Any of them may be supplied
/// through a run variable instead (`credentials_variable`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub api_key: Option<String>,
    pub api_key_header: Option<String>,
}

impl Credentials {
    /// Fill missing fields from a delegated credential object.
    pub fn merge_delegated(&mut self, delegated: &Value) {
        let field = |name: &str| delegated.get(name).and_then(Value::as_str).map(str::to_string);
        self.username = self.username.take().or_else(|| field("username"));
        self.password = self.password.take().or_else(|| field("password"));
        self.token = self.token.take().or_else(|| field("token"));
        self.api_key = self.api_key.take().or_else(|| field("api_key"));
        self.api_key_header = self.api_key_header.take().or_else(|| field("api_key_header"));
    }

    pub fn map(self, f: impl Fn(String) -> String) -> Self {
        Self {
            username: self.username.map(&f),
            password: self.password.map(&f),
            token: self.token.map(&f),
            api_key: self.api_key.map(&f),
            api_key_header: self.api_key_header.map(&f),
        }
    }
}

/// Config-time checks for the chosen strategy.
pub fn validate(auth_type: AuthType, credentials: &Credentials, delegated: bool) -> Vec<String> {
    let mut errors = Vec::new();
    match auth_type {
        AuthType::None => {}
        AuthType::Basic => {
            if !delegated && (credentials.username.is_none() || credentials.password.is_none()) {
                errors.push("basic auth requires username and password".to_string());
            }
        }
        AuthType::Bearer => {
            if !delegated && credentials.token.is_none() {
                errors.push("bearer auth requires a token".to_string());
            }
        }
        AuthType::ApiKey => {
            if !delegated && credentials.api_key.is_none() {
                errors.push("api_key auth requires api_key".to_string());
            }
            if !delegated && credentials.api_key_header.as_deref().map_or(true, str::is_empty) {
                errors.push("api_key auth requires api_key_header".to_string());
            }
        }
        AuthType::Oauth2 | AuthType::Custom => {
            errors.push(format!("auth_type '{}' is not supported", auth_type.as_str()));
        }
    }
    errors
}

/// Write the authentication header for `auth_type` into `headers`.
pub fn apply(
    auth_type: AuthType,
    credentials: &Credentials,
    headers: &mut BTreeMap<String, String>,
) -> Result<(), NodeError> {
    let missing = |what: &str| {
        NodeError::Configuration(format!("{} auth is missing {}", auth_type.as_str(), what))
    };
    match auth_type {
        AuthType::None => {}
        AuthType::Basic => {
            let username = credentials.username.as_deref().ok_or_else(|| missing("username"))?;
            let password = credentials.password.as_deref().ok_or_else(|| missing("password"))?;
            let encoded = STANDARD.encode(format!("{}:{}", username, password));
            headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
        }
        AuthType::Bearer => {
            let token = credentials.token.as_deref().ok_or_else(|| missing("token"))?;
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }
        AuthType::ApiKey => {
            let key = credentials.api_key.as_deref().ok_or_else(|| missing("api_key"))?;
            let header = credentials
                .api_key_header
                .as_deref()
                .ok_or_else(|| missing("api_key_header"))?;
            headers.insert(header.to_string(), key.to_string());
        }
        AuthType::Oauth2 | AuthType::Custom => {
            return Err(NodeError::Configuration(format!(
                "auth_type '{}' is not supported",
                auth_type.as_str()
            )));
        }
    }
    Ok(())
}
