//! Build script for dfiber-runtime
//!
//! Handles configuration merging:
//! 1. Start with library defaults
//! 2. If DFIBER_CONFIG_RS env var is set, parse the user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/dfiber_defaults.rs
//!
//! The user file only lists the constants it wants to change, e.g.
//!
//! ```text
//! pub const THREADS: usize = 8;
//! pub const MAX_WAIT_MS: u64 = 500;
//! ```

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Configuration parameter definition
struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

/// All configuration parameters with their defaults
const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "THREADS",
        rust_type: "usize",
        default_value: "1",
    },
    ConfigParam {
        name: "USE_CALLER",
        rust_type: "bool",
        default_value: "true",
    },
    ConfigParam {
        name: "NAME",
        rust_type: "&str",
        default_value: "\"dfiber\"",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "128 * 1024",
    },
    ConfigParam {
        name: "MAX_WAIT_MS",
        rust_type: "u64",
        default_value: "3000",
    },
    ConfigParam {
        name: "EVENT_BATCH",
        rust_type: "usize",
        default_value: "256",
    },
    ConfigParam {
        name: "INITIAL_FD_SLOTS",
        rust_type: "usize",
        default_value: "32",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("dfiber_defaults.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    let user_path = env::var("DFIBER_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                for unknown in parse_and_merge(&content, &mut config) {
                    println!("cargo:warning=Unknown config parameter: {}", unknown);
                }
                println!("cargo:warning=Using custom config: {}", path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read DFIBER_CONFIG_RS ({}): {}", path, e);
            }
        }
    }
    println!("cargo:rerun-if-env-changed=DFIBER_CONFIG_RS");

    let output = generate_config(&config, user_path.as_deref());
    fs::write(&dest_path, output).expect("Failed to write merged config");
}

/// Merge `pub const NAME: TYPE = VALUE;` lines into `config`
///
/// Returns the names that are not known parameters.
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) -> Vec<String> {
    let mut unknown = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some((name, value)) = parse_const_line(line) else {
            continue;
        };
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => unknown.push(name),
        }
    }
    unknown
}

/// Parse a single const line and return (name, value)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim();
    let value = value.strip_suffix(';').unwrap_or(value).trim();
    Some((name.trim().to_string(), value.to_string()))
}

/// Generate the merged defaults file
fn generate_config(config: &HashMap<&str, String>, user_path: Option<&str>) -> String {
    let mut output = String::new();
    output.push_str("// Auto-generated by build.rs - do not edit\n");
    match user_path {
        Some(path) => output.push_str(&format!("// Library defaults merged with {}\n\n", path)),
        None => output.push_str("// Library defaults\n\n"),
    }
    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        assert_eq!(
            parse_const_line("pub const THREADS: usize = 8;"),
            Some(("THREADS".into(), "8".into()))
        );
        assert_eq!(
            parse_const_line("pub const NAME: &str = \"io\";"),
            Some(("NAME".into(), "\"io\"".into()))
        );
        assert_eq!(
            parse_const_line("pub const STACK_SIZE: usize = 256 * 1024;"),
            Some(("STACK_SIZE".into(), "256 * 1024".into()))
        );
        assert_eq!(parse_const_line("const X: u8 = 1;"), None);
    }

    #[test]
    fn test_parse_and_merge() {
        let mut config: HashMap<&str, String> = HashMap::new();
        config.insert("THREADS", "1".into());
        config.insert("MAX_WAIT_MS", "3000".into());

        let user_config = r#"
            // Custom config
            pub const THREADS: usize = 16;
            pub const MAX_WAIT_MS: u64 = 500;
            pub const BOGUS: u8 = 1;
        "#;

        let unknown = parse_and_merge(user_config, &mut config);
        assert_eq!(config.get("THREADS"), Some(&"16".to_string()));
        assert_eq!(config.get("MAX_WAIT_MS"), Some(&"500".to_string()));
        assert_eq!(unknown, vec!["BOGUS".to_string()]);
    }
}
