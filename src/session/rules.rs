//! Row and field level access rules evaluated against the current user.
//!
//! Rules are plain closures over a [`RuleContext`] so host code can mix the
//! builders here with its own checks, then compose them with [`RuleSet`].

use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use crate::session::user::{FieldPath, Record, User};

/// Everything a rule may look at.
#[derive(Clone, Copy)]
pub struct RuleContext<'a> {
    pub user: Option<&'a User>,
    pub target: Option<&'a dyn Record>,
    pub args: &'a Map<String, Value>,
}

pub type Rule = Arc<dyn Fn(&RuleContext<'_>) -> bool + Send + Sync>;
pub type Getter = Arc<dyn Fn(&RuleContext<'_>) -> Option<Value> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    /// Left side contains the right side.
    In,
    NotIn,
    /// Left side contains the right side.
    Like,
    NotLike,
}

impl Operator {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Like => "like",
            Self::NotLike => "not like",
        }
    }

    /// Apply the operator. Ordering between mismatched types and membership
    /// on a non-container are always false, negated forms included.
    #[must_use]
    pub fn apply(self, left: &Value, right: &Value) -> bool {
        match self {
            Self::Eq => values_equal(left, right),
            Self::Ne => !values_equal(left, right),
            Self::Gt => order(left, right).is_some_and(std::cmp::Ordering::is_gt),
            Self::Ge => order(left, right).is_some_and(std::cmp::Ordering::is_ge),
            Self::Lt => order(left, right).is_some_and(std::cmp::Ordering::is_lt),
            Self::Le => order(left, right).is_some_and(std::cmp::Ordering::is_le),
            Self::In | Self::Like => contains(left, right) == Some(true),
            Self::NotIn | Self::NotLike => contains(left, right) == Some(false),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            "in" => Ok(Self::In),
            "not in" => Ok(Self::NotIn),
            "like" => Ok(Self::Like),
            "not like" => Ok(Self::NotLike),
            other => Err(format!("unknown operator: {other}")),
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn contains(container: &Value, item: &Value) -> Option<bool> {
    match container {
        Value::String(haystack) => item.as_str().map(|needle| haystack.contains(needle)),
        Value::Array(items) => Some(items.iter().any(|candidate| values_equal(candidate, item))),
        Value::Object(map) => item.as_str().map(|key| map.contains_key(key)),
        _ => None,
    }
}

/// Right-hand side of a comparison.
#[derive(Clone)]
pub enum Operand {
    /// Attribute of the entity being accessed.
    Target(FieldPath),
    /// Caller supplied argument.
    Argument(String),
    Constant(Value),
    Derived(Getter),
}

impl Operand {
    #[must_use]
    pub fn target(path: &str) -> Self {
        Self::Target(FieldPath::parse(path))
    }

    #[must_use]
    pub fn argument(name: &str) -> Self {
        Self::Argument(name.to_string())
    }

    fn resolve(&self, context: &RuleContext<'_>) -> Option<Value> {
        match self {
            Self::Target(path) => context.target.and_then(|target| path.resolve(target)),
            Self::Argument(name) => context.args.get(name).filter(|v| !v.is_null()).cloned(),
            Self::Constant(value) => Some(value.clone()),
            Self::Derived(getter) => getter(context),
        }
    }
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target(path) => f.debug_tuple("Target").field(path).finish(),
            Self::Argument(name) => f.debug_tuple("Argument").field(name).finish(),
            Self::Constant(value) => f.debug_tuple("Constant").field(value).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Read an attribute path off the current user.
#[must_use]
pub fn user_attr_getter(path: &str) -> Getter {
    let path = FieldPath::parse(path);
    Arc::new(move |context: &RuleContext<'_>| context.user.and_then(|user| path.resolve(user)))
}

/// Compare a user attribute with `operand`. Missing values compare as null;
/// without a user the rule fails.
#[must_use]
pub fn compare(user_path: &str, operator: Operator, operand: Operand) -> Rule {
    let path = FieldPath::parse(user_path);
    Arc::new(move |context: &RuleContext<'_>| {
        let Some(user) = context.user else {
            return false;
        };
        let left = path.resolve(user).unwrap_or(Value::Null);
        let right = operand.resolve(context).unwrap_or(Value::Null);
        operator.apply(&left, &right)
    })
}

/// Where the role being modified comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoleSource {
    Target(FieldPath),
    Argument(String),
}

/// Allow when the current user's role lists the affected role in `table`.
#[must_use]
pub fn can_modify_role(table: Arc<HashMap<String, Vec<String>>>, source: RoleSource) -> Rule {
    Arc::new(move |context: &RuleContext<'_>| {
        let Some(user) = context.user else {
            return false;
        };
        let role = match &source {
            RoleSource::Target(path) => context.target.and_then(|target| path.resolve(target)),
            RoleSource::Argument(name) => context.args.get(name).cloned(),
        };
        let Some(Value::String(role)) = role else {
            return false;
        };
        table
            .get(&user.role)
            .is_some_and(|permitted| permitted.iter().any(|allowed| *allowed == role))
    })
}

/// Rules joined with the AND/OR connectors. Empty `All` passes, empty `Any`
/// fails.
#[derive(Clone)]
pub enum RuleSet {
    Rule(Rule),
    All(Vec<RuleSet>),
    Any(Vec<RuleSet>),
}

impl RuleSet {
    #[must_use]
    pub fn evaluate(&self, context: &RuleContext<'_>) -> bool {
        match self {
            Self::Rule(rule) => rule(context),
            Self::All(rules) => rules.iter().all(|rule| rule.evaluate(context)),
            Self::Any(rules) => rules.iter().any(|rule| rule.evaluate(context)),
        }
    }
}

impl From<Rule> for RuleSet {
    fn from(rule: Rule) -> Self {
        Self::Rule(rule)
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(_) => f.write_str("Rule(..)"),
            Self::All(rules) => f.debug_tuple("All").field(rules).finish(),
            Self::Any(rules) => f.debug_tuple("Any").field(rules).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> User {
        User {
            id: 7,
            login_id: "ana@example.com".to_string(),
            role: "support".to_string(),
            active: true,
            ..User::default()
        }
        .with_attribute("team", json!({"id": 3, "tags": ["blue", "night"]}))
        .with_attribute("level", json!(4))
    }

    fn with<F: FnOnce(&RuleContext<'_>)>(target: &Value, args: &Value, f: F) {
        let user = user();
        let args = args.as_object().cloned().unwrap_or_default();
        let context = RuleContext {
            user: Some(&user),
            target: Some(target),
            args: &args,
        };
        f(&context);
    }

    #[test]
    fn operators_parse_and_display() {
        for op in ["=", "!=", ">", ">=", "<", "<=", "in", "not in", "like", "not like"] {
            let parsed: Operator = op.parse().unwrap_or(Operator::Eq);
            assert_eq!(parsed.to_string(), op);
        }
        assert!("~".parse::<Operator>().is_err());
    }

    #[test]
    fn operator_semantics() {
        assert!(Operator::Eq.apply(&json!(3), &json!(3.0)));
        assert!(Operator::Gt.apply(&json!(4), &json!(3)));
        assert!(!Operator::Gt.apply(&json!("4"), &json!(3)));
        assert!(Operator::Le.apply(&json!("abc"), &json!("abd")));
        assert!(Operator::In.apply(&json!(["a", "b"]), &json!("b")));
        assert!(Operator::NotIn.apply(&json!(["a", "b"]), &json!("c")));
        assert!(Operator::Like.apply(&json!("ana@example.com"), &json!("@example")));
        assert!(Operator::NotLike.apply(&json!("ana@example.com"), &json!("@other")));
        assert!(!Operator::NotIn.apply(&Value::Null, &json!("c")));
    }

    #[test]
    fn compare_against_target_argument_constant_and_derived() {
        let target = json!({"owner": {"team_id": 3}, "min_level": 5});
        let args = json!({"team": 3});
        with(&target, &args, |context| {
            assert!(compare("team.id", Operator::Eq, Operand::target("owner__team_id"))(context));
            assert!(compare("team__id", Operator::Eq, Operand::argument("team"))(context));
            assert!(!compare("level", Operator::Ge, Operand::target("min_level"))(context));
            assert!(compare("team.tags", Operator::In, Operand::Constant(json!("night")))(context));
            let derived = Operand::Derived(user_attr_getter("id"));
            assert!(compare("id", Operator::Eq, derived)(context));
        });
    }

    #[test]
    fn getter_short_circuits_on_missing_paths() {
        with(&json!({}), &json!({}), |context| {
            assert_eq!(user_attr_getter("team.id")(context), Some(json!(3)));
            assert_eq!(user_attr_getter("manager.team.id")(context), None);
            assert!(compare("manager.id", Operator::Eq, Operand::argument("missing"))(context));
        });
    }

    #[test]
    fn rules_without_a_user_fail() {
        let args = Map::new();
        let context = RuleContext {
            user: None,
            target: None,
            args: &args,
        };
        assert!(!compare("id", Operator::Ne, Operand::Constant(json!(1)))(&context));
        assert_eq!(user_attr_getter("id")(&context), None);
    }

    #[test]
    fn modify_role_table() {
        let mut table = HashMap::new();
        table.insert(
            "support".to_string(),
            vec!["user".to_string(), "guest".to_string()],
        );
        let table = Arc::new(table);
        let by_target = can_modify_role(
            table.clone(),
            RoleSource::Target(FieldPath::parse("role")),
        );
        let by_argument = can_modify_role(table, RoleSource::Argument("role".to_string()));

        with(&json!({"role": "user"}), &json!({"role": "admin"}), |context| {
            assert!(by_target(context));
            assert!(!by_argument(context));
        });
        with(&json!({}), &json!({"role": "guest"}), |context| {
            assert!(!by_target(context));
            assert!(by_argument(context));
        });
    }

    #[test]
    fn rule_sets_compose() {
        let yes: Rule = Arc::new(|_: &RuleContext<'_>| true);
        let no: Rule = Arc::new(|_: &RuleContext<'_>| false);
        with(&json!({}), &json!({}), |context| {
            assert!(RuleSet::All(vec![]).evaluate(context));
            assert!(!RuleSet::Any(vec![]).evaluate(context));
            let nested = RuleSet::All(vec![
                yes.clone().into(),
                RuleSet::Any(vec![no.clone().into(), yes.clone().into()]),
            ]);
            assert!(nested.evaluate(context));
            assert!(!RuleSet::All(vec![yes.into(), no.into()]).evaluate(context));
        });
    }
}
