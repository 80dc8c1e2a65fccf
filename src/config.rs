// CONFIGURATION MANAGEMENT
//
// This module defines a struct to represent engine configurations and
// functions to add apps and links to a configuration.
//
//   Config - inspectable, cloneable configuration structure
//   ConfigError - errors raised while building or applying a configuration
//   new() -> Config - create a new empty configuration
//   app(&mut Config, name, &AppArg) - add a natively-typed app to a configuration
//   app_from_args::<T>(&mut Config, name, Args) -> Result<(), ConfigError> -
//       add a dynamically-keyed, schema-validated app to a configuration
//   link(&mut Config, linkspec) -> Result<(), ConfigError> - add a link
//   link_with_capacity(&mut Config, linkspec, usize) -> Result<(), ConfigError> -
//       add a link overriding its default ring capacity
//   parse_link(spec) -> Result<LinkSpec, ConfigError>
//
// Two ways to describe an app's argument are supported, matching the two
// kinds of caller this contract serves:
//
//   - a native Rust struct implementing `engine::AppConfig` directly --
//     "required" vs. "defaulted" fields are simply struct fields with or
//     without a `Default`, checked by the compiler. This is the path nearly
//     every app in this crate (and its ancestors) uses.
//   - a dynamically-keyed `Args` map, validated at runtime against an
//     `ArgSchema`, for app classes wired up by an external configuration
//     loader that only has untyped key/value pairs to work with.

use super::engine;

use std::collections::HashMap;
use std::collections::HashSet;
use regex::Regex;
use once_cell::sync::Lazy;
use serde_json::Value;
use thiserror::Error;

// Config can be applied by engine.
#[derive(Clone)]
pub struct Config {
    pub apps: HashMap<String, Box<dyn engine::AppArg>>,
    pub links: HashSet<String>,
    // Per-link ring capacity override, keyed by canonical link spec. Links
    // not present here get the engine's default capacity.
    pub link_capacity: HashMap<String, usize>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("link references undefined app `{0}`")]
    UndefinedApp(String),
    #[error("invalid link spec: `{0}`")]
    BadLinkSpec(String),
    #[error("duplicate link spec: `{0}`")]
    DuplicateLink(String),
    #[error("missing required config key `{0}`")]
    MissingRequiredArg(String),
    #[error("unknown config key `{0}`")]
    UnknownArg(String),
    #[error("app constructor for `{0}` failed")]
    ConstructorFailed(String),
}

// API: Create a new configuration.
// Initially there are no apps or links.
pub fn new() -> Config {
    Config { apps: HashMap::new(), links: HashSet::new(), link_capacity: HashMap::new() }
}

// API: Add a natively-typed app to the configuration.
//
// Example: config::app(&mut c, "source", &basic_apps::Source {size: 60})
pub fn app(config: &mut Config, name: &str, app: &dyn engine::AppArg) {
    config.apps.insert(name.to_string(), app.box_clone());
}

// API: Add a dynamically-keyed, schema-validated app to the configuration.
//
// Validates `args` against `T::schema()` before constructing `T`, filling in
// declared defaults for omitted optional keys; fails synchronously on a
// missing required key or an unrecognized one.
pub fn app_from_args<T>(config: &mut Config, name: &str, args: Args) -> Result<(), ConfigError>
where
    T: SchemaConfig + Clone + 'static,
{
    let validated = T::schema().validate(&args)?;
    let instance = T::from_args(&validated);
    app(config, name, &instance);
    Ok(())
}

// API: Add a link to the configuration.
//
// Example: config::link(&mut c, "nic.tx -> vm.rx")
pub fn link(config: &mut Config, spec: &str) -> Result<(), ConfigError> {
    let canonical = canonical_link(spec)?;
    if !config.links.insert(canonical.clone()) {
        return Err(ConfigError::DuplicateLink(canonical));
    }
    Ok(())
}

// API: Add a link to the configuration, overriding its default ring
// capacity. Useful for a link that needs to absorb bigger bursts than the
// default depth allows, at the cost of more buffering latency under load.
//
// Example: config::link_with_capacity(&mut c, "nic.tx -> vm.rx", 8192)
pub fn link_with_capacity(config: &mut Config, spec: &str, capacity: usize) -> Result<(), ConfigError> {
    let canonical = canonical_link(spec)?;
    if !config.links.insert(canonical.clone()) {
        return Err(ConfigError::DuplicateLink(canonical));
    }
    config.link_capacity.insert(canonical, capacity);
    Ok(())
}

// Given "a.out -> b.in" return
//   LinkSpec { from: "a", output:"out", to: "b", input: "in" }.
pub fn parse_link(spec: &str) -> Result<LinkSpec, ConfigError> {
    LINK_SYNTAX.captures(spec)
        .map(|cap| LinkSpec {
            from: (&cap[1]).to_string(), output: (&cap[2]).to_string(),
            to: (&cap[3]).to_string(), input: (&cap[4]).to_string(),
        })
        .ok_or_else(|| ConfigError::BadLinkSpec(spec.to_string()))
}

pub struct LinkSpec {
    pub from: String, pub output: String,
    pub to: String, pub input: String
}

static LINK_SYNTAX: Lazy<Regex> = Lazy::new
    (|| Regex::new(r"^ *([\w_]+)\.([\w_]+) *-> *([\w_]+)\.([\w_]+) *$").unwrap());

fn format_link(spec: &LinkSpec) -> String {
    format!("{}.{} -> {}.{}", spec.from, spec.output, spec.to, spec.input)
}

fn canonical_link(spec: &str) -> Result<String, ConfigError> {
    Ok(format_link(&parse_link(spec)?))
}

// A dynamically-keyed app argument map, for loader-driven app classes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(pub HashMap<String, Value>);

impl Args {
    pub fn new() -> Self { Args(HashMap::new()) }
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }
    pub fn get(&self, key: &str) -> Option<&Value> { self.0.get(key) }
}

// A single config-schema option: required, or optional with a default.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub required: bool,
    pub default: Option<Value>,
}

impl OptionSpec {
    pub fn required() -> Self { OptionSpec { required: true, default: None } }
    pub fn with_default(value: impl Into<Value>) -> Self {
        OptionSpec { required: false, default: Some(value.into()) }
    }
}

// A static config schema: the permitted keys for an app class's Args, and
// whether each is required or has a default.
#[derive(Debug, Clone, Default)]
pub struct ArgSchema(pub HashMap<String, OptionSpec>);

impl ArgSchema {
    pub fn new() -> Self { ArgSchema(HashMap::new()) }

    pub fn option(mut self, key: &str, spec: OptionSpec) -> Self {
        self.0.insert(key.to_string(), spec);
        self
    }

    // Reject unknown keys, reject missing required keys, and fill in
    // declared defaults for keys the caller omitted.
    pub fn validate(&self, args: &Args) -> Result<Args, ConfigError> {
        for key in args.0.keys() {
            if !self.0.contains_key(key) {
                return Err(ConfigError::UnknownArg(key.clone()));
            }
        }
        let mut filled = args.clone();
        for (key, spec) in &self.0 {
            if !filled.0.contains_key(key) {
                if spec.required {
                    return Err(ConfigError::MissingRequiredArg(key.clone()));
                } else if let Some(default) = &spec.default {
                    filled.0.insert(key.clone(), default.clone());
                }
            }
        }
        Ok(filled)
    }
}

// Implemented by app classes that are configured from a dynamically-keyed
// Args map (rather than constructed directly as a Rust struct literal).
pub trait SchemaConfig: engine::AppConfig {
    fn schema() -> ArgSchema where Self: Sized;
    fn from_args(args: &Args) -> Self where Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_apps;

    #[test]
    fn config () {
        let mut c = new();
        app(&mut c, "source", &basic_apps::Source {size: 60});
        link(&mut c, "source.output -> sink.input").unwrap();
        assert_eq!(c.apps.len(), 1);
        assert_eq!(c.links.len(), 1);
    }

    #[test]
    fn parse_link_accepts_optional_whitespace() {
        let a = parse_link("a.out->b.in").unwrap();
        assert_eq!((a.from.as_str(), a.output.as_str(), a.to.as_str(), a.input.as_str()),
                   ("a", "out", "b", "in"));
        let b = parse_link("  a.out  ->  b.in  ").unwrap();
        assert_eq!((b.from.as_str(), b.output.as_str(), b.to.as_str(), b.input.as_str()),
                   ("a", "out", "b", "in"));
    }

    #[test]
    fn link_with_capacity_records_the_override() {
        let mut c = new();
        link_with_capacity(&mut c, "a.out -> b.in", 8192).unwrap();
        assert_eq!(c.link_capacity.get("a.out -> b.in"), Some(&8192));
    }

    #[test]
    fn parse_link_rejects_garbage() {
        assert!(parse_link("not a link spec").is_err());
        assert!(parse_link("a.out -> b").is_err());
    }

    #[test]
    fn link_rejects_exact_duplicates() {
        let mut c = new();
        link(&mut c, "a.out -> b.in").unwrap();
        let err = link(&mut c, "a.out -> b.in").unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateLink(_)));
        // Distinct specs that normalize to the same canonical form still count
        // as the same link.
        let err2 = link(&mut c, "  a.out  ->   b.in").unwrap_err();
        assert!(matches!(err2, ConfigError::DuplicateLink(_)));
    }

    #[derive(Debug, Clone)]
    struct Schematic;
    impl engine::AppConfig for Schematic {
        fn new(&self) -> Box<dyn engine::App> { Box::new(SchematicApp) }
    }
    impl SchemaConfig for Schematic {
        fn schema() -> ArgSchema {
            ArgSchema::new()
                .option("a", OptionSpec::required())
                .option("b", OptionSpec::with_default("foo"))
        }
        fn from_args(_args: &Args) -> Self { Schematic }
    }
    struct SchematicApp;
    impl engine::App for SchematicApp {}

    #[test]
    fn app_from_args_rejects_missing_required_key() {
        let mut c = new();
        let err = app_from_args::<Schematic>(&mut c, "x", Args::new().with("b", "bar"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequiredArg(k) if k == "a"));
    }

    #[test]
    fn app_from_args_rejects_unknown_key() {
        let mut c = new();
        let err = app_from_args::<Schematic>(
            &mut c, "x", Args::new().with("a", 1).with("c", "nope"),
        ).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownArg(k) if k == "c"));
    }

    #[test]
    fn app_from_args_fills_defaults_and_succeeds() {
        let mut c = new();
        app_from_args::<Schematic>(&mut c, "x", Args::new().with("a", 1)).unwrap();
        assert_eq!(c.apps.len(), 1);
    }
}
