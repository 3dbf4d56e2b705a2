// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones. Each location is tried as
/// YAML first, then as a TOML fallback for sites that prefer that format.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/agentcore/config.yaml"));
    paths.push(PathBuf::from("/etc/agentcore/config.toml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/agentcore/config.yaml"));
        paths.push(home.join(".config/agentcore/config.toml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("agentcore/config.yaml"));
        paths.push(cfg.join("agentcore/config.toml"));
    }

    paths.push(PathBuf::from(".agentcore.yaml"));
    paths.push(PathBuf::from(".agentcore.toml"));
    paths.push(PathBuf::from("agentcore.yaml"));
    paths.push(PathBuf::from("agentcore.toml"));

    paths
}

/// Parses a config layer, picking TOML or YAML by the file's extension.
/// Both converge on `serde_yaml::Value` so `merge_yaml` can treat every layer
/// the same regardless of the format it came from.
fn parse_layer(path: &Path, text: &str) -> anyhow::Result<serde_yaml::Value> {
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        let value: toml::Value =
            toml::from_str(text).with_context(|| format!("parsing {}", path.display()))?;
        serde_yaml::to_value(value)
            .with_context(|| format!("converting {} to the merge representation", path.display()))
    } else {
        serde_yaml::from_str(text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Load configuration by merging all discovered YAML/TOML files, with an
/// optional explicit override path (e.g. a CLI `--config` flag) applied last.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer = parse_layer(&path, &text)?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer = parse_layer(p, &text)?;
        merge_yaml(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged configuration")?
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("router:\n  balanced_model: a\n  temperature: 0.5");
        let src = val("router:\n  balanced_model: b");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["router"]["balanced_model"].as_str(), Some("b"));
        assert_eq!(dst["router"]["temperature"].as_f64(), Some(0.5));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/agentcore_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.router.balanced_model, "gpt-4o");
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "router:\n  balanced_model: custom-model\n").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.router.balanced_model, "custom-model");
    }

    #[test]
    fn load_explicit_toml_file_overrides_defaults() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[router]\nbalanced_model = \"toml-model\"\n").unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.router.balanced_model, "toml-model");
    }

    #[test]
    fn parse_layer_dispatches_on_extension() {
        let toml_val = parse_layer(Path::new("x.toml"), "x = 1").unwrap();
        assert_eq!(toml_val["x"].as_i64(), Some(1));
        let yaml_val = parse_layer(Path::new("x.yaml"), "x: 1").unwrap();
        assert_eq!(yaml_val["x"].as_i64(), Some(1));
    }
}
