use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// The structured record produced by a successful extraction run.
///
/// Holds the JSON object returned by the language model exactly as it was
/// returned. No schema is enforced: the expected keys are `total`,
/// `business`, `items` and `address`, but any object is kept, including ones
/// where those keys are missing or have unexpected shapes. The typed
/// accessors below read the expected keys leniently and return `None` (or an
/// empty list) when a value is absent or unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredReceipt(Map<String, Value>);

/// One entry of the receipt's `items` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: Option<String>,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
}

impl StructuredReceipt {
    pub fn from_object(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn as_object(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Grand total. Accepts JSON numbers and numeric strings such as `"$12.50"`.
    pub fn total(&self) -> Option<Decimal> {
        self.0.get("total").and_then(decimal_from_value)
    }

    pub fn business(&self) -> Option<&str> {
        self.text_field("business")
    }

    pub fn address(&self) -> Option<&str> {
        self.text_field("address")
    }

    /// Line items in the order the model listed them. Entries that are not
    /// JSON objects are skipped.
    pub fn items(&self) -> Vec<LineItem> {
        let Some(Value::Array(entries)) = self.0.get("items") else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(Value::as_object)
            .map(|item| LineItem {
                name: item
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                price: item.get("price").and_then(decimal_from_value),
                quantity: item.get("quantity").and_then(decimal_from_value),
            })
            .collect()
    }

    fn text_field(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let repr = n.to_string();
            Decimal::from_str(&repr)
                .or_else(|_| Decimal::from_scientific(&repr))
                .ok()
        }
        Value::String(s) => {
            // Models sometimes echo the printed form: "$1,234.50", "12.50 USD".
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            Decimal::from_str(&cleaned).ok()
        }
        _ => None,
    }
}
