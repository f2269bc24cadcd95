//! Reading and writing record batches.

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use geolabel_core::Record;
use serde_json::Value;

pub fn read(path: &Path) -> anyhow::Result<Vec<Record>> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("cannot read records from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("cannot read records from {}", path.display()))?
    };

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let values: Vec<Value> = if is_yaml {
        serde_yaml::from_str(&text).context("records must be a YAML list")?
    } else {
        serde_json::from_str(&text).context("records must be a JSON array")?
    };

    values
        .into_iter()
        .enumerate()
        .map(|(i, v)| Record::try_from(v).with_context(|| format!("record #{i}")))
        .collect()
}

pub fn write(path: Option<&Path>, records: &[Record]) -> anyhow::Result<()> {
    let mut text = serde_json::to_string_pretty(records).context("serialize records")?;
    text.push('\n');
    match path {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("cannot write {}", path.display())),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}
