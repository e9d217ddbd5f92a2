use crate::types::Table;

/// Role of the signed-in user, as reported by the session provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Cook,
    Admin,
    Other(String),
}

impl Role {
    pub fn parse(text: &str) -> Self {
        match text {
            "server" => Role::Server,
            "cook" => Role::Cook,
            "admin" => Role::Admin,
            other => Role::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Server => "server",
            Role::Cook => "cook",
            Role::Admin => "admin",
            Role::Other(name) => name,
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Role::parse(value)
    }
}

/// Order statuses a kitchen station is actively working.
const ACTIVE_PREPARATION_STATUSES: &str = "pending,preparing,ready";

/// Server-side filter predicate for a (table, role, identity) triple.
///
/// This shrinks data transfer only; access control is enforced server-side
/// independently. Unknown roles therefore fail open to no predicate, and
/// `admin` sees everything.
///
/// Must be recomputed whenever the session's role or identity changes;
/// subscriptions holding a stale predicate are torn down and recreated.
pub fn filter_for(table: &Table, role: &Role, identity: &str) -> Option<String> {
    match (table.as_str(), role) {
        ("orders", Role::Server) => Some(format!("server_id=eq.{identity}")),
        ("orders", Role::Cook) => Some(format!("status=in.({ACTIVE_PREPARATION_STATUSES})")),
        ("order_routing", Role::Cook) => Some(format!("assigned_to=eq.{identity}")),
        ("tables", Role::Server) => Some(format!("server_id=eq.{identity}")),
        _ => None,
    }
}

/// Client-side evaluation of the predicate forms this module emits
/// (`col=eq.value` and `col=in.(a,b)`), used when subscriptions with
/// different predicates share one pooled channel. Unrecognized predicate
/// syntax fails open: this is a transfer optimization, not access control.
pub fn row_matches(predicate: &str, row: &serde_json::Value) -> bool {
    let Some((column, condition)) = predicate.split_once('=') else {
        return true;
    };
    let field = match row.get(column) {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Number(number)) => number.to_string(),
        Some(serde_json::Value::Bool(flag)) => flag.to_string(),
        _ => return true,
    };
    if let Some(expected) = condition.strip_prefix("eq.") {
        return field == expected;
    }
    if let Some(set) = condition
        .strip_prefix("in.(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return set.split(',').any(|candidate| candidate == field);
    }
    true
}
