//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;

use crate::error::Result;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::TargetKind;

    const YAML: &str = r#"
source:
  host: mssql.local
  database: Vault
  user: sa
  password: secret
target:
  type: postgresql
  host: pg.local
  database: vault
  user: postgres
  password: secret
  ssl_mode: require
migration:
  batch_size: 500
  exclude_tables: [Event]
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.target.kind, TargetKind::Postgres);
        assert_eq!(config.target.db.ssl_mode, "require");
        assert_eq!(config.source.port_or(1433), 1433);
        assert_eq!(config.source.schema_or("dbo"), "dbo");
        assert!(config.source.trust_server_cert);
        assert!(!config.source.encrypt);
        assert_eq!(config.migration.batch_size, 500);
        assert_eq!(config.migration.json_sample_size, 100);
        assert!(config.migration.use_bulk);
        assert!(!config.migration.table_selected("event"));
        assert!(config.migration.table_selected("User"));
    }

    #[test]
    fn test_sqlite_target_needs_only_database() {
        let yaml = r#"
source: { host: h, database: d, user: u }
target: { type: sqlite, database: /tmp/out.db }
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.target.kind, TargetKind::Sqlite);
    }

    #[test]
    fn test_unknown_target_type_rejected() {
        let yaml = r#"
source: { host: h, database: d, user: u }
target: { type: oracle, host: h, database: d, user: u }
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_csv_section_defaults_and_overrides() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.csv.output_dir, std::path::PathBuf::from("csv_export"));
        assert_eq!(config.csv.delimiter, ',');
        assert_eq!(config.csv.fallback_delimiter, '|');
        assert!(config.csv.include_headers);

        let yaml = r#"
source: { host: h, database: d, user: u }
target: { type: sqlite, database: out.db }
csv:
  output_dir: /data/staging
  delimiter: "\t"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.csv.output_dir, std::path::PathBuf::from("/data/staging"));
        assert_eq!(config.csv.delimiter, '\t');
    }

    #[test]
    fn test_password_not_serialized() {
        let config = Config::from_yaml(YAML).unwrap();
        let out = serde_yaml::to_string(&config).unwrap();
        assert!(!out.contains("secret"));
    }
}
