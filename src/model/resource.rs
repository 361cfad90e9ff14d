//! Resources: devices or channels a task connects to, delivered as CSV bundles.

use serde::{Deserialize, Serialize};

/// One device/channel bound to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Resource {
    pub id: String,
    pub gb_id: String,
    pub parent_id: String,
    pub area_number: String,
    pub dominion_code: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub func: String,
    #[serde(rename = "mvcIP")]
    pub mvc_ip: String,
    pub mvc_port: String,
    pub mvc_username: String,
    pub mvc_password: String,
    pub mvc_channels: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl Resource {
    /// Build a resource from one CSV record. Column order is fixed; missing trailing
    /// columns stay empty and extra columns are ignored.
    pub fn from_record(fields: &[String]) -> Self {
        let col = |i: usize| fields.get(i).map(|s| s.trim().to_string()).unwrap_or_default();
        Self {
            id: col(0),
            gb_id: col(1),
            parent_id: col(2),
            area_number: col(3),
            dominion_code: col(4),
            kind: col(5),
            func: col(6),
            mvc_ip: col(7),
            mvc_port: col(8),
            mvc_username: col(9),
            mvc_password: col(10),
            mvc_channels: col(11),
            name: String::new(),
        }
    }
}

/// Decode a resource bundle. Blank lines, rows without an id and a leading `id,...`
/// header row are skipped.
pub fn parse_bundle(csv: &str) -> Vec<Resource> {
    let mut resources = Vec::new();
    for (index, record) in records(csv).into_iter().enumerate() {
        let resource = Resource::from_record(&record);
        if resource.id.is_empty() {
            continue;
        }
        if index == 0 && resource.id.eq_ignore_ascii_case("id") {
            continue;
        }
        resources.push(resource);
    }
    resources
}

/// Split CSV text into records. Supports quoted fields with `""` escapes and
/// embedded separators or newlines.
fn records(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => quoted = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                if row.iter().any(|f| !f.is_empty()) {
                    rows.push(std::mem::take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(c),
        }
    }

    row.push(field);
    if row.iter().any(|f| !f.is_empty()) {
        rows.push(row);
    }
    rows
}
