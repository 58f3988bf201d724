/// Data for the backend's model listing endpoints.
/// `/api/tags` lists every model the backend knows about; `/api/ps` lists the ones currently
/// resident in memory. Both return the same envelope, so one set of types covers them.
use serde::{Deserialize, Serialize};

/// Tag implied when a model name carries none.
pub(crate) const DEFAULT_TAG: &str = "latest";

/// One entry of a model listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct ListedModel {
    /// The name the model is addressed by, e.g. `gemma3:1b`.
    #[serde(default)]
    pub(crate) name: String,
    /// Some backends report the addressable name here instead of (or as well as) `name`.
    #[serde(default)]
    pub(crate) model: Option<String>,
}

impl ListedModel {
    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str())
            .chain(self.model.as_deref())
            .filter(|name| !name.is_empty())
    }
}

/// The response envelope of both listing endpoints.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct ListModelResponse {
    #[serde(default)]
    pub(crate) models: Vec<ListedModel>,
}

impl ListModelResponse {
    pub(crate) fn names(&self) -> Vec<&str> {
        self.models.iter().flat_map(ListedModel::names).collect()
    }
}

/// Splits `name:tag` into its base name and tag. A trailing `:` counts as no tag.
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let name = name.trim().trim_end_matches(':');
    match name.rsplit_once(':') {
        // a colon inside a registry host:port prefix is not a tag separator
        Some((base, tag)) if !tag.contains('/') => (base, Some(tag)),
        _ => (name, None),
    }
}

/// Canonical `base:tag` form, with the implicit `latest` tag made explicit.
pub(crate) fn normalize(name: &str) -> String {
    let (base, tag) = split_tag(name);
    format!("{}:{}", base, tag.unwrap_or(DEFAULT_TAG))
}

/// Strict match used for "is the model resident?": equal once both sides are normalized.
pub(crate) fn is_same_model(listed: &str, wanted: &str) -> bool {
    listed == wanted || normalize(listed) == normalize(wanted)
}

/// Lenient match used when confirming a model exists: exact name, the wanted name with any tag,
/// or the same base name with the tag dropped.
pub(crate) fn is_listed_variant(listed: &str, wanted: &str) -> bool {
    let wanted = wanted.trim().trim_end_matches(':');
    if listed == wanted {
        return true;
    }

    let (listed_base, _) = split_tag(listed);
    let (wanted_base, wanted_tag) = split_tag(wanted);
    match wanted_tag {
        None => listed_base == wanted_base,
        Some(_) => is_same_model(listed, wanted),
    }
}
