//! Typed build options with source-ranked precedence.
//!
//! Every option records where its current value came from. Setting a value
//! from a lower-ranked source than the current one is a no-op; an equal or
//! higher rank overwrites. This is what lets `meson_options.txt` defaults,
//! environment variables, project `default_options`, and `-D` flags layer
//! predictably.

use indexmap::IndexMap;
use thiserror::Error;

use crate::lang::object::{FeatureState, Heap, Obj};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionSource {
    Unset,
    Default,
    Environment,
    Yield,
    DefaultOptions,
    SubprojectDefaultOptions,
    OverrideOptions,
    DeprecatedRename,
    Commandline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    String,
    Boolean,
    Combo,
    Integer,
    Array,
    Feature,
    ShellArray,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("unknown option '{0}'")]
    Unknown(String),
    #[error("option '{name}': invalid value '{value}'")]
    InvalidValue { name: String, value: String },
    #[error("option '{name}': value {value} out of range [{min}, {max}]")]
    OutOfRange { name: String, value: i64, min: i64, max: i64 },
    #[error("option '{name}': '{value}' is not one of {choices:?}")]
    BadChoice { name: String, value: String, choices: Vec<String> },
    #[error("malformed option argument '{0}', expected name=value")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct OptionRecord {
    pub name: String,
    pub typ: OptionType,
    pub choices: Vec<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub value: Obj,
    pub source: OptionSource,
    pub description: String,
    /// Set for project options declared by a subproject.
    pub subproject: Option<String>,
}

/// The per-workspace option table. Iteration order is declaration order.
#[derive(Debug, Default)]
pub struct OptionStore {
    opts: IndexMap<String, OptionRecord>,
}

impl OptionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the builtin options every workspace carries.
    pub fn init_builtins(&mut self, heap: &mut Heap) {
        let combo = |choices: &[&str]| choices.iter().map(|c| (*c).to_owned()).collect();
        self.declare(heap, "buildtype", OptionType::Combo, "debug")
            .choices = combo(&["plain", "debug", "debugoptimized", "release", "minsize", "custom"]);
        self.declare(heap, "optimization", OptionType::Combo, "0").choices =
            combo(&["plain", "0", "g", "1", "2", "3", "s"]);
        self.declare_bool(heap, "debug", true);
        self.declare(heap, "warning_level", OptionType::Combo, "1").choices =
            combo(&["0", "1", "2", "3", "everything"]);
        self.declare_bool(heap, "werror", false);
        self.declare(heap, "default_library", OptionType::Combo, "shared").choices =
            combo(&["shared", "static", "both"]);
        self.declare(heap, "prefix", OptionType::String, "/usr/local");
        self.declare(heap, "bindir", OptionType::String, "bin");
        self.declare(heap, "libdir", OptionType::String, "lib");
        self.declare(heap, "backend_max_links", OptionType::Integer, "0");
        for lang in ["c", "cpp"] {
            self.declare_array(heap, &format!("{lang}_args"));
            self.declare_array(heap, &format!("{lang}_link_args"));
        }
        // env.CC-style compiler overrides, fed from the environment.
        self.declare(heap, "env.CC", OptionType::ShellArray, "");
        self.declare(heap, "env.CXX", OptionType::ShellArray, "");
    }

    fn declare(
        &mut self,
        heap: &mut Heap,
        name: &str,
        typ: OptionType,
        default: &str,
    ) -> &mut OptionRecord {
        let value = match typ {
            OptionType::Array | OptionType::ShellArray => {
                let arr = heap.arr_new();
                if !default.is_empty() {
                    let item = heap.str_intern(default.as_bytes());
                    heap.arr_push(arr, item);
                }
                arr
            }
            _ => heap.str_intern(default.as_bytes()),
        };
        let record = OptionRecord {
            name: name.to_owned(),
            typ,
            choices: Vec::new(),
            min: None,
            max: None,
            value,
            source: OptionSource::Default,
            description: String::new(),
            subproject: None,
        };
        self.opts.insert(name.to_owned(), record);
        self.opts.get_mut(name).unwrap_or_else(|| unreachable!("just inserted"))
    }

    fn declare_bool(&mut self, heap: &mut Heap, name: &str, default: bool) {
        let record = self.declare(heap, name, OptionType::Boolean, "");
        record.value = if default { Obj::TRUE } else { Obj::FALSE };
    }

    fn declare_array(&mut self, heap: &mut Heap, name: &str) {
        self.declare(heap, name, OptionType::Array, "");
    }

    /// Register a project option (from an options file `option()` call).
    pub fn declare_project(&mut self, record: OptionRecord) {
        self.opts.entry(record.name.clone()).or_insert(record);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OptionRecord> {
        self.opts.get(name)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<Obj> {
        self.opts.get(name).map(|o| o.value)
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &OptionRecord> {
        self.opts.values()
    }

    /// Set an already-coerced value, honoring source precedence: a
    /// lower-ranked source never overwrites a higher-ranked one.
    pub fn set(
        &mut self,
        name: &str,
        value: Obj,
        source: OptionSource,
    ) -> Result<bool, OptionError> {
        let Some(record) = self.opts.get_mut(name) else {
            return Err(OptionError::Unknown(name.to_owned()));
        };
        if source < record.source {
            return Ok(false);
        }
        record.value = value;
        record.source = source;
        Ok(true)
    }

    /// Parse and set a textual value (from `-D`, the environment, or
    /// `default_options`) according to the option's declared type.
    pub fn set_from_str(
        &mut self,
        heap: &mut Heap,
        name: &str,
        text: &str,
        source: OptionSource,
    ) -> Result<bool, OptionError> {
        let Some(record) = self.opts.get(name) else {
            return Err(OptionError::Unknown(name.to_owned()));
        };
        let value = coerce(heap, record, text)?;
        self.set(name, value, source)
    }

    /// Parse a `name=value` command-line option setting. A
    /// `subproject:name=value` prefix routes to that subproject's option;
    /// settings for subprojects that never get configured are held rather
    /// than rejected.
    pub fn set_cmdline(&mut self, heap: &mut Heap, arg: &str) -> Result<(), OptionError> {
        let Some((name, value)) = arg.split_once('=') else {
            return Err(OptionError::Malformed(arg.to_owned()));
        };
        let name = name.trim();
        if let Some((subproject, opt_name)) = name.split_once(':') {
            if self.opts.contains_key(name) {
                self.set_from_str(heap, name, value.trim(), OptionSource::Commandline)?;
                return Ok(());
            }
            let record = OptionRecord {
                name: name.to_owned(),
                typ: OptionType::String,
                choices: Vec::new(),
                min: None,
                max: None,
                value: heap.str_intern(value.trim().as_bytes()),
                source: OptionSource::Commandline,
                description: String::new(),
                subproject: Some(subproject.to_owned()),
            };
            let _ = opt_name;
            self.opts.insert(record.name.clone(), record);
            return Ok(());
        }
        self.set_from_str(heap, name, value.trim(), OptionSource::Commandline)?;
        Ok(())
    }
}

fn coerce(heap: &mut Heap, record: &OptionRecord, text: &str) -> Result<Obj, OptionError> {
    let invalid = || OptionError::InvalidValue {
        name: record.name.clone(),
        value: text.to_owned(),
    };
    match record.typ {
        OptionType::String => Ok(heap.str_intern(text.as_bytes())),
        OptionType::Boolean => match text {
            "true" => Ok(Obj::TRUE),
            "false" => Ok(Obj::FALSE),
            _ => Err(invalid()),
        },
        OptionType::Combo => {
            if record.choices.iter().any(|c| c == text) {
                Ok(heap.str_intern(text.as_bytes()))
            } else {
                Err(OptionError::BadChoice {
                    name: record.name.clone(),
                    value: text.to_owned(),
                    choices: record.choices.clone(),
                })
            }
        }
        OptionType::Integer => {
            let value: i64 = text.parse().map_err(|_| invalid())?;
            let min = record.min.unwrap_or(i64::MIN);
            let max = record.max.unwrap_or(i64::MAX);
            if value < min || value > max {
                return Err(OptionError::OutOfRange { name: record.name.clone(), value, min, max });
            }
            Ok(heap.make_number(value))
        }
        OptionType::Array => {
            let arr = heap.arr_new();
            for part in text.split(',').filter(|p| !p.is_empty()) {
                let item = heap.str_intern(part.trim().as_bytes());
                heap.arr_push(arr, item);
            }
            Ok(arr)
        }
        OptionType::Feature => {
            let state = match text {
                "enabled" => FeatureState::Enabled,
                "disabled" => FeatureState::Disabled,
                "auto" => FeatureState::Auto,
                _ => return Err(invalid()),
            };
            Ok(heap.make_feature(state))
        }
        OptionType::ShellArray => {
            let arr = heap.arr_new();
            let parts = shlex::split(text).unwrap_or_default();
            for part in parts {
                let item = heap.str_intern(part.as_bytes());
                heap.arr_push(arr, item);
            }
            Ok(arr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn store() -> (OptionStore, Heap) {
        let mut heap = Heap::new();
        let mut opts = OptionStore::new();
        opts.init_builtins(&mut heap);
        (opts, heap)
    }

    #[rstest]
    fn lower_ranked_source_is_a_no_op() {
        let (mut opts, mut heap) = store();
        opts.set_from_str(&mut heap, "werror", "true", OptionSource::Commandline).expect("set");
        let changed = opts
            .set_from_str(&mut heap, "werror", "false", OptionSource::DefaultOptions)
            .expect("set");
        assert!(!changed);
        assert_eq!(opts.value("werror"), Some(Obj::TRUE));
    }

    #[rstest]
    fn equal_rank_overwrites() {
        let (mut opts, mut heap) = store();
        opts.set_from_str(&mut heap, "werror", "true", OptionSource::Commandline).expect("set");
        let changed = opts
            .set_from_str(&mut heap, "werror", "false", OptionSource::Commandline)
            .expect("set");
        assert!(changed);
        assert_eq!(opts.value("werror"), Some(Obj::FALSE));
    }

    #[rstest]
    fn combo_rejects_unknown_choice() {
        let (mut opts, mut heap) = store();
        let err = opts
            .set_from_str(&mut heap, "buildtype", "bogus", OptionSource::Commandline)
            .expect_err("must fail");
        assert!(matches!(err, OptionError::BadChoice { .. }));
    }

    #[rstest]
    fn cmdline_parsing_splits_on_equals() {
        let (mut opts, mut heap) = store();
        opts.set_cmdline(&mut heap, "buildtype=release").expect("set");
        let v = opts.value("buildtype").expect("value");
        assert_eq!(heap.str_bytes(v), b"release");
        assert!(opts.set_cmdline(&mut heap, "nonsense").is_err());
    }

    #[rstest]
    fn shell_array_splits_like_a_shell() {
        let (mut opts, mut heap) = store();
        opts.set_from_str(&mut heap, "env.CC", "ccache gcc", OptionSource::Environment)
            .expect("set");
        let v = opts.value("env.CC").expect("value");
        let items: Vec<Vec<u8>> =
            heap.arr_to_vec(v).iter().map(|o| heap.str_bytes(*o).to_vec()).collect();
        assert_eq!(items, vec![b"ccache".to_vec(), b"gcc".to_vec()]);
    }

    #[rstest]
    fn unknown_option_errors() {
        let (mut opts, mut heap) = store();
        let err = opts
            .set_from_str(&mut heap, "no_such", "x", OptionSource::Commandline)
            .expect_err("must fail");
        assert_eq!(err, OptionError::Unknown("no_such".into()));
    }
}
