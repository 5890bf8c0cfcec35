use vigil_core::audit::AuditEntry;
use vigil_core::{Result, VigilError};

/// Export output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            _ => Err(format!("Unknown export format: {}", s)),
        }
    }
}

/// Every exportable field, in canonical column order.
pub const EXPORT_FIELDS: &[&str] = &[
    "id",
    "timestamp",
    "event_type",
    "user_id",
    "user_email",
    "user_role",
    "action",
    "resource",
    "resource_id",
    "ip_address",
    "user_agent",
    "session_id",
    "result",
    "severity",
    "error_message",
    "hash",
    "previous_hash",
];

/// Resolve the field selection: empty means all fields; unknown names are a
/// validation error.
fn resolve_fields<'a>(fields: &'a [String]) -> Result<Vec<&'a str>> {
    if fields.is_empty() {
        return Ok(EXPORT_FIELDS.to_vec());
    }

    let mut resolved = Vec::with_capacity(fields.len());
    for field in fields {
        let known = EXPORT_FIELDS
            .iter()
            .find(|f| **f == field.as_str())
            .copied()
            .ok_or_else(|| VigilError::Validation(format!("unknown export field: {}", field)))?;
        resolved.push(known);
    }
    Ok(resolved)
}

fn field_value(entry: &AuditEntry, field: &str) -> String {
    match field {
        "id" => entry.id.to_string(),
        "timestamp" => entry.timestamp.to_rfc3339(),
        "event_type" => entry.event_type.to_string(),
        "user_id" => entry.actor.user_id.clone(),
        "user_email" => entry.actor.user_email.clone(),
        "user_role" => entry.actor.user_role.clone(),
        "action" => entry.action.clone(),
        "resource" => entry.resource.clone(),
        "resource_id" => entry.resource_id.clone(),
        "ip_address" => entry.ip_address.clone(),
        "user_agent" => entry.user_agent.clone(),
        "session_id" => entry.session_id.clone(),
        "result" => entry.result.to_string(),
        "severity" => entry.severity.to_string(),
        "error_message" => entry.error_message.clone().unwrap_or_default(),
        "hash" => hex(&entry.hash),
        "previous_hash" => hex(&entry.previous_hash),
        _ => String::new(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RFC 4180 quoting: wrap when needed, double embedded quotes.
fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Export entries as CSV with a header row.
pub fn export_csv(entries: &[AuditEntry], fields: &[String]) -> Result<String> {
    let fields = resolve_fields(fields)?;

    let mut out = String::new();
    out.push_str(&fields.join(","));
    out.push('\n');

    for entry in entries {
        let row: Vec<String> = fields
            .iter()
            .map(|f| csv_escape(&field_value(entry, f)))
            .collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }

    Ok(out)
}

/// Export entries as a JSON array of objects holding the selected fields.
pub fn export_json(entries: &[AuditEntry], fields: &[String]) -> Result<String> {
    let fields = resolve_fields(fields)?;

    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| {
            let mut object = serde_json::Map::new();
            for field in &fields {
                object.insert(
                    field.to_string(),
                    serde_json::Value::String(field_value(entry, field)),
                );
            }
            serde_json::Value::Object(object)
        })
        .collect();

    serde_json::to_string_pretty(&rows).map_err(Into::into)
}

/// Export in the requested format.
pub fn export(entries: &[AuditEntry], format: ExportFormat, fields: &[String]) -> Result<String> {
    match format {
        ExportFormat::Csv => export_csv(entries, fields),
        ExportFormat::Json => export_json(entries, fields),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use vigil_core::audit::{AuditActor, AuditEvent, AuditEventType, GENESIS_HASH};

    fn entries(n: usize) -> Vec<AuditEntry> {
        let mut out: Vec<AuditEntry> = Vec::new();
        for i in 0..n {
            let event = AuditEvent::new(
                AuditEventType::CircuitPause,
                AuditActor::new(format!("u-{}", i), "ops@example.com", "operator"),
                "pause",
                "circuit-breaker",
                format!("cb-{}", i),
            );
            let prev = out.last().map(|e| e.hash).unwrap_or(GENESIS_HASH);
            out.push(AuditEntry::from_event(event, Uuid::new_v4(), Utc::now(), prev));
        }
        out
    }

    #[test]
    fn test_csv_has_header_and_rows() {
        let rows = entries(3);
        let csv = export_csv(&rows, &[]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("id,timestamp,event_type"));
        assert!(lines[1].contains("circuit.pause"));
    }

    #[test]
    fn test_csv_field_subset() {
        let rows = entries(1);
        let fields = vec!["event_type".to_string(), "result".to_string()];
        let csv = export_csv(&rows, &fields).unwrap();

        assert_eq!(csv.lines().next().unwrap(), "event_type,result");
        assert_eq!(csv.lines().nth(1).unwrap(), "circuit.pause,success");
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let rows = entries(1);
        let fields = vec!["password".to_string()];
        assert!(matches!(
            export_csv(&rows, &fields),
            Err(VigilError::Validation(_))
        ));
    }

    #[test]
    fn test_json_round_trip_matches_query_fields() {
        let rows = entries(2);
        let json = export_json(&rows, &[]).unwrap();
        let parsed: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.len(), 2);
        for (row, entry) in parsed.iter().zip(rows.iter()) {
            assert_eq!(row["id"], entry.id.to_string());
            assert_eq!(row["event_type"], "circuit.pause");
            assert_eq!(row["user_email"], "ops@example.com");
            assert_eq!(row["hash"].as_str().unwrap().len(), 64);
        }
    }

    #[test]
    fn test_csv_round_trip_preserves_entries() {
        let rows = entries(3);
        let csv = export_csv(&rows, &[]).unwrap();

        // Re-parse through a matching field set; ids and hashes must line up.
        let mut lines = csv.lines();
        let header: Vec<&str> = lines.next().unwrap().split(',').collect();
        let id_col = header.iter().position(|h| *h == "id").unwrap();
        let hash_col = header.iter().position(|h| *h == "hash").unwrap();

        for (line, entry) in lines.zip(rows.iter()) {
            let cols: Vec<&str> = line.split(',').collect();
            assert_eq!(cols[id_col], entry.id.to_string());
            assert_eq!(cols[hash_col], hex(&entry.hash));
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
