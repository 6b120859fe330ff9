//! Catalog Parser
//!
//! Loads step catalogs from YAML files. Parsing only builds the immutable
//! [`Catalog`]; wildcard expansion and graph construction happen later,
//! once configuration is known.

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{EngineError, Result};

use super::model::Catalog;
use super::validator::validate_catalog;

/// Loads a catalog from a YAML file.
///
/// This function:
/// 1. Reads the file
/// 2. Parses the YAML into step definitions
/// 3. Validates the catalog structure
///
/// # Example
///
/// ```rust,no_run
/// use daijin::workflow::load_catalog;
///
/// fn main() -> daijin::Result<()> {
///     let catalog = load_catalog("daijin.yaml")?;
///     println!("Loaded {} steps", catalog.len());
///     Ok(())
/// }
/// ```
pub fn load_catalog(path: impl AsRef<Path>) -> Result<Catalog> {
    let path = path.as_ref();
    info!("Loading catalog from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        EngineError::Catalog(format!(
            "failed to read catalog file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_catalog(&yaml_content)
}

/// Parses and validates a catalog from YAML text.
pub fn parse_catalog(yaml: &str) -> Result<Catalog> {
    let catalog: Catalog = serde_yaml::from_str(yaml)
        .map_err(|e| EngineError::Catalog(format!("failed to parse catalog YAML: {}", e)))?;

    info!(
        "Parsed {} steps, {} wildcards defined",
        catalog.steps.len(),
        catalog.wildcards.len()
    );

    validate_catalog(&catalog)?;

    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Activation, PathBinding};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CATALOG: &str = r#"
wildcards:
  chunk:
    range:
      count: { config: chunks, default: 2 }
      width: 3

steps:
  - name: split
    inputs:
      fasta: genome.fa
    outputs:
      done: split/split.done
    command: split {input.fasta} && touch {output.done}

  - name: align
    fan_out: chunk
    best_effort: true
    when: { non_empty: db }
    inputs:
      marker: split/split.done
    outputs:
      hits: align/{chunk}.tsv
    threads: { config: align_threads, default: 2 }
    command: align -t {threads} > {output.hits}

  - name: align_all
    inputs:
      parts: { gather: "align/{chunk}.tsv", over: chunk }
    outputs:
      merged: align/all.tsv
    command: cat {input.parts} > {output.merged}
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = parse_catalog(CATALOG).unwrap();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.wildcards.contains_key("chunk"));

        let align = catalog.get_step("align").unwrap();
        assert!(align.best_effort);
        assert_eq!(align.fan_out.as_deref(), Some("chunk"));
        assert_eq!(align.when, Some(Activation::NonEmpty("db".into())));

        let gather = catalog.get_step("align_all").unwrap().input("parts").unwrap();
        assert_eq!(
            gather.binding,
            PathBinding::Gather { gather: "align/{chunk}.tsv".into(), over: "chunk".into() }
        );
    }

    #[test]
    fn test_load_catalog_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();

        let catalog = load_catalog(file.path()).unwrap();
        assert_eq!(catalog.steps[0].name, "split");
    }

    #[test]
    fn test_missing_file() {
        let err = load_catalog("/nonexistent/daijin.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read catalog file"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = parse_catalog("steps: [ { name: a, command: ").unwrap_err();
        assert!(matches!(err, EngineError::Catalog(_)));
    }

    #[test]
    fn test_validation_runs_after_parse() {
        let yaml = r#"
steps:
  - name: a
    fan_out: sample
    command: echo
"#;
        let err = parse_catalog(yaml).unwrap_err();
        assert!(err.to_string().contains("undeclared wildcard 'sample'"));
    }
}
