//! User records as seen by the session core, plus attribute traversal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct User {
    pub id: i64,
    pub login_id: String,
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    pub role: String,
    pub active: bool,
    pub name: String,
    pub avatar: Option<String>,
    pub social_id: Option<String>,
    pub social_origin: Option<String>,
    /// Extra columns or computed values available to access rules.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[schema(value_type = Object)]
    pub attributes: Map<String, Value>,
}

impl User {
    #[must_use]
    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

/// A user to be provisioned by a federated or social login.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewUser {
    pub login_id: String,
    pub password_hash: Option<String>,
    /// `None` leaves the role to the store default.
    pub role: Option<String>,
    pub active: bool,
    pub name: String,
    pub avatar: Option<String>,
    pub social_id: Option<String>,
    pub social_origin: Option<String>,
}

/// Named field access used by access rules.
pub trait Record {
    fn field(&self, name: &str) -> Option<Value>;
}

impl Record for User {
    fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "id" => Value::from(self.id),
            "login_id" => Value::from(self.login_id.clone()),
            "role" => Value::from(self.role.clone()),
            "active" => Value::from(self.active),
            "name" => Value::from(self.name.clone()),
            "avatar" => self.avatar.clone().map_or(Value::Null, Value::from),
            "social_id" => self.social_id.clone().map_or(Value::Null, Value::from),
            "social_origin" => self.social_origin.clone().map_or(Value::Null, Value::from),
            other => return self.attributes.get(other).cloned(),
        };
        Some(value)
    }
}

impl Record for Value {
    fn field(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl Record for Map<String, Value> {
    fn field(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Dotted or double-underscore attribute path, e.g. `profile__team__name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    #[must_use]
    pub fn parse(path: &str) -> Self {
        let segments = path
            .split("__")
            .flat_map(|part| part.split('.'))
            .filter(|segment| !segment.is_empty())
            .map(ToString::to_string)
            .collect();
        Self { segments }
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Walk the path; a missing or null step ends the walk with `None`.
    pub fn resolve(&self, record: &dyn Record) -> Option<Value> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = record.field(first)?;
        for segment in rest {
            if current.is_null() {
                return None;
            }
            current = current.get(segment.as_str())?.clone();
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }
}
