use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

pub const USER_KIND: &str = "user";
pub const WORKSPACE_KIND: &str = "workspace";
pub const MULTI_KIND: &str = "multi";

/// Signed-in user as supplied by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
    // provider specific extras, e.g. intercomHash
    #[serde(flatten, default)]
    pub attributes: BTreeMap<String, Value>,
}

/// One kind of evaluation context, e.g. the user or the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleContext {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

/// Identity handed to the flag backend.
///
/// A multi context holds at most one sub-context per kind, in insertion order.
/// A multi context is never built around a single sub-context; that case is
/// always represented as `Single`.
#[derive(Debug, Clone, PartialEq)]
pub enum Context {
    Single(SingleContext),
    Multi(Vec<SingleContext>),
}

/// Build the user sub-context; no user means an anonymous context.
pub fn create_user_context(user: Option<&User>, locale: &str) -> SingleContext {
    match user {
        None => SingleContext {
            kind: USER_KIND.to_string(),
            anonymous: Some(true),
            key: None,
            email: None,
            name: None,
            locale: Some(locale.to_string()),
            attributes: BTreeMap::new(),
        },
        Some(user) => SingleContext {
            kind: USER_KIND.to_string(),
            anonymous: Some(false),
            key: Some(user.user_id.clone()),
            email: Some(user.email.clone()),
            name: Some(user.name.clone()),
            locale: Some(locale.to_string()),
            attributes: user.attributes.clone(),
        },
    }
}

/// Build an auxiliary sub-context such as `{kind: "workspace", key}`.
pub fn create_context(kind: &str, key: &str) -> SingleContext {
    SingleContext {
        kind: kind.to_string(),
        anonymous: None,
        key: Some(key.to_string()),
        email: None,
        name: None,
        locale: None,
        attributes: BTreeMap::new(),
    }
}

/// Compose sub-contexts. A later sub-context replaces an earlier one of the
/// same kind in place.
pub fn create_multi_context(
    first: SingleContext,
    rest: impl IntoIterator<Item = SingleContext>,
) -> Context {
    let mut contexts = vec![first];
    for context in rest {
        match contexts.iter_mut().find(|c| c.kind == context.kind) {
            Some(existing) => *existing = context,
            None => contexts.push(context),
        }
    }

    if contexts.len() == 1 {
        Context::Single(contexts.remove(0))
    } else {
        Context::Multi(contexts)
    }
}

impl Context {
    pub fn kind(&self) -> &str {
        match self {
            Context::Single(context) => &context.kind,
            Context::Multi(_) => MULTI_KIND,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Context::Multi(_))
    }

    /// Inverse of [`create_multi_context`].
    pub fn single_contexts(&self) -> Vec<SingleContext> {
        match self {
            Context::Single(context) => vec![context.clone()],
            Context::Multi(contexts) => contexts.clone(),
        }
    }

    pub fn get(&self, kind: &str) -> Option<&SingleContext> {
        match self {
            Context::Single(context) => (context.kind == kind).then_some(context),
            Context::Multi(contexts) => contexts.iter().find(|c| c.kind == kind),
        }
    }

    /// Key of the sub-context of `kind`, if present.
    pub fn key_of(&self, kind: &str) -> Option<&str> {
        self.get(kind).and_then(|c| c.key.as_deref())
    }

    /// Copy of this context with `context` added, replacing any sub-context of
    /// the same kind.
    pub fn with(&self, context: SingleContext) -> Context {
        let mut contexts = self.single_contexts().into_iter();
        match contexts.next() {
            Some(first) => create_multi_context(first, contexts.chain(std::iter::once(context))),
            None => Context::Single(context),
        }
    }

    /// Copy of this context without the sub-context of `kind`. Returns `None`
    /// when nothing would be left.
    pub fn without(&self, kind: &str) -> Option<Context> {
        let mut remaining = self
            .single_contexts()
            .into_iter()
            .filter(|c| c.kind != kind);
        let first = remaining.next()?;
        Some(create_multi_context(first, remaining))
    }
}

impl Serialize for Context {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Context::Single(context) => context.serialize(serializer),
            Context::Multi(contexts) => {
                let mut map = serializer.serialize_map(Some(contexts.len() + 1))?;
                map.serialize_entry("kind", MULTI_KIND)?;
                for context in contexts {
                    map.serialize_entry(&context.kind, context)?;
                }
                map.end()
            }
        }
    }
}
