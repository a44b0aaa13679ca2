use serde::{Deserialize, Serialize};

define_id!(LabelId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: LabelId,
    pub name: String,
    /// Color tag, e.g. `#ef4444` or a theme token such as `red`.
    pub color: String,
    #[serde(default)]
    pub description: Option<String>,
}
