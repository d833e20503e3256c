//! Reactive value holders: UI elements and State.
//!
//! A holder is created by exactly one cell execution and bound to one global
//! name. Its value changes only through the trigger subsystem (interaction
//! events) or a State setter called from a cell.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::graph::CellId;

/// Stable identity of a holder across re-renders of its owning cell's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(uuid::Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Widget definition sent to the frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WidgetDef {
    /// Numeric slider widget.
    Slider {
        label: String,
        min: f64,
        max: f64,
        step: f64,
    },
    /// Text input widget.
    TextInput { label: String, placeholder: String },
    /// Dropdown select widget; the value is the selected index.
    Select { label: String, options: Vec<String> },
    /// Checkbox widget.
    Checkbox { label: String },
}

impl WidgetDef {
    /// Coerce an incoming value into the widget's domain.
    ///
    /// Sliders snap to the nearest step above `min` and clamp into
    /// `[min, max]`; selects clamp the index into the option list. A value of
    /// the wrong JSON type, or a slider with unusable bounds, is rejected.
    pub fn normalize(&self, value: Json) -> Result<Json> {
        match self {
            WidgetDef::Slider {
                label,
                min,
                max,
                step,
            } => {
                if !(min.is_finite() && max.is_finite() && min <= max) {
                    return Err(Error::InvalidOperation(format!(
                        "slider '{}' has invalid bounds [{}, {}]",
                        label, min, max
                    )));
                }
                if !(step.is_finite() && *step > 0.0) {
                    return Err(Error::InvalidOperation(format!(
                        "slider '{}' has invalid step {}",
                        label, step
                    )));
                }
                let n = value.as_f64().ok_or_else(|| wrong_type(label, "a number"))?;
                let snapped = min + ((n - min) / step).round() * step;
                Ok(Json::from(snapped.clamp(*min, *max)))
            }
            WidgetDef::TextInput { label, .. } => match value {
                Json::String(_) => Ok(value),
                _ => Err(wrong_type(label, "a string")),
            },
            WidgetDef::Select { label, options } => {
                let index = value.as_u64().ok_or_else(|| wrong_type(label, "an index"))?;
                let last = options.len().saturating_sub(1) as u64;
                Ok(Json::from(index.min(last)))
            }
            WidgetDef::Checkbox { label } => match value {
                Json::Bool(_) => Ok(value),
                _ => Err(wrong_type(label, "a boolean")),
            },
        }
    }
}

fn wrong_type(label: &str, expected: &str) -> Error {
    Error::InvalidOperation(format!("widget '{}' expects {}", label, expected))
}

/// What kind of holder this is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HolderKind {
    /// Front-end element driven by interaction events.
    UiElement { widget: WidgetDef },
    /// Shared state driven by setter calls from cells.
    State,
}

/// A UI element or State bound to a global name.
#[derive(Debug)]
pub struct ValueHolder {
    object_id: ObjectId,
    owner: CellId,
    name: String,
    kind: HolderKind,
    value: RwLock<Json>,
}

/// Shared handle to a holder.
pub type HolderHandle = Arc<ValueHolder>;

impl ValueHolder {
    pub(crate) fn new(owner: CellId, name: impl Into<String>, kind: HolderKind, initial: Json) -> HolderHandle {
        Arc::new(Self {
            object_id: ObjectId::new(),
            owner,
            name: name.into(),
            kind,
            value: RwLock::new(initial),
        })
    }

    /// Identity token shared by every rendered copy of this holder.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// The cell whose execution created this holder.
    pub fn owner(&self) -> CellId {
        self.owner
    }

    /// The global name the holder is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &HolderKind {
        &self.kind
    }

    pub fn is_state(&self) -> bool {
        matches!(self.kind, HolderKind::State)
    }

    /// Current value.
    pub fn value(&self) -> Json {
        self.value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the stored value. Reserved to the trigger subsystem and State
    /// setters.
    pub(crate) fn store(&self, value: Json) {
        *self.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_slider_clamps() {
        let slider = WidgetDef::Slider {
            label: "speed".to_string(),
            min: 0.0,
            max: 10.0,
            step: 1.0,
        };
        assert_eq!(slider.normalize(json!(42)).unwrap(), json!(10.0));
        assert_eq!(slider.normalize(json!(-1.5)).unwrap(), json!(0.0));
        assert!(slider.normalize(json!("fast")).is_err());
    }

    #[test]
    fn test_slider_snaps_to_step() {
        let slider = WidgetDef::Slider {
            label: "ratio".to_string(),
            min: 1.0,
            max: 3.0,
            step: 0.5,
        };
        assert_eq!(slider.normalize(json!(2.3)).unwrap(), json!(2.5));
        assert_eq!(slider.normalize(json!(1.1)).unwrap(), json!(1.0));
        assert_eq!(slider.normalize(json!(2.9)).unwrap(), json!(3.0));
    }

    #[test]
    fn test_slider_with_bad_bounds_is_rejected() {
        let inverted = WidgetDef::Slider {
            label: "bad".to_string(),
            min: 5.0,
            max: 1.0,
            step: 1.0,
        };
        assert!(matches!(
            inverted.normalize(json!(3)),
            Err(Error::InvalidOperation(_))
        ));

        let flat = WidgetDef::Slider {
            label: "flat".to_string(),
            min: 0.0,
            max: 1.0,
            step: 0.0,
        };
        assert!(matches!(
            flat.normalize(json!(0.5)),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_select_clamps_index() {
        let select = WidgetDef::Select {
            label: "mode".to_string(),
            options: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(select.normalize(json!(7)).unwrap(), json!(1));
        assert!(select.normalize(json!(-1)).is_err());
    }

    #[test]
    fn test_text_and_checkbox_types() {
        let text = WidgetDef::TextInput {
            label: "name".to_string(),
            placeholder: String::new(),
        };
        assert_eq!(text.normalize(json!("hi")).unwrap(), json!("hi"));
        assert!(text.normalize(json!(1)).is_err());

        let check = WidgetDef::Checkbox {
            label: "on".to_string(),
        };
        assert_eq!(check.normalize(json!(true)).unwrap(), json!(true));
        assert!(check.normalize(json!("yes")).is_err());
    }

    #[test]
    fn test_holder_identity_and_store() {
        let holder = ValueHolder::new(CellId::new(2), "s", HolderKind::State, json!(0));
        assert_eq!(holder.owner(), CellId::new(2));
        assert_eq!(holder.name(), "s");
        assert!(holder.is_state());

        holder.store(json!(5));
        assert_eq!(holder.value(), json!(5));

        let other = ValueHolder::new(CellId::new(2), "s", HolderKind::State, json!(0));
        assert_ne!(holder.object_id(), other.object_id());
    }

    #[test]
    fn test_widget_serialization() {
        let kind = HolderKind::UiElement {
            widget: WidgetDef::Checkbox {
                label: "on".to_string(),
            },
        };
        let encoded = serde_json::to_value(&kind).unwrap();
        assert_eq!(encoded["kind"], "ui_element");
        assert_eq!(encoded["widget"]["type"], "checkbox");
    }
}
