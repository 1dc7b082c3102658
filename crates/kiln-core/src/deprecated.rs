//! Deprecated configuration aliases.
//!
//! Renamed options are described entirely by [`DEPRECATED_ALIASES`]. The table
//! is applied once, while a configuration is being built; nothing else in the
//! workspace knows about old option names.

use crate::error::{KilnError, Result};
use crate::warnings::CompatibilityWarning;
use serde_json::{Map, Value};

/// How a deprecated value is translated onto its canonical option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueMapping {
    /// Copied unchanged.
    Identity,
    /// `true` becomes precision 16, `false` precision 32.
    AmpToPrecision,
    /// `true` becomes refresh rate 1, `false` refresh rate 0.
    FlagToRefreshRate,
    /// The option has no effect anymore; only the warning remains.
    Ignored,
}

/// One row of the alias table.
#[derive(Debug, Clone, Copy)]
pub struct DeprecatedAlias {
    /// Deprecated option name.
    pub old: &'static str,
    /// Canonical option name, if the option still maps onto one.
    pub canonical: Option<&'static str>,
    /// Version the alias was deprecated in.
    pub since: &'static str,
    /// Version the alias will be removed in.
    pub removal: &'static str,
    /// Value translation.
    pub mapping: ValueMapping,
}

/// Every deprecated option name kiln still accepts.
pub const DEPRECATED_ALIASES: &[DeprecatedAlias] = &[
    alias("gradient_clip", "gradient_clip_val", "0.5.0", "0.8.0"),
    alias("nb_gpu_nodes", "num_nodes", "0.5.0", "0.8.0"),
    alias("num_gpu_nodes", "num_nodes", "0.5.0", "0.8.0"),
    alias("max_nb_epochs", "max_epochs", "0.5.0", "0.8.0"),
    alias("min_nb_epochs", "min_epochs", "0.5.0", "0.8.0"),
    alias("nb_sanity_val_steps", "num_sanity_val_steps", "0.5.0", "0.8.0"),
    alias("add_row_log_interval", "row_log_interval", "0.5.0", "0.8.0"),
    DeprecatedAlias {
        old: "use_amp",
        canonical: Some("precision"),
        since: "0.7.0",
        removal: "0.9.0",
        mapping: ValueMapping::AmpToPrecision,
    },
    DeprecatedAlias {
        old: "show_progress_bar",
        canonical: Some("progress_bar_refresh_rate"),
        since: "0.7.2",
        removal: "0.9.0",
        mapping: ValueMapping::FlagToRefreshRate,
    },
    DeprecatedAlias {
        old: "print_nan_grads",
        canonical: None,
        since: "0.7.2",
        removal: "0.9.0",
        mapping: ValueMapping::Ignored,
    },
];

const fn alias(
    old: &'static str,
    canonical: &'static str,
    since: &'static str,
    removal: &'static str,
) -> DeprecatedAlias {
    DeprecatedAlias {
        old,
        canonical: Some(canonical),
        since,
        removal,
        mapping: ValueMapping::Identity,
    }
}

/// Look up a deprecated option name.
pub fn lookup(name: &str) -> Option<&'static DeprecatedAlias> {
    DEPRECATED_ALIASES.iter().find(|a| a.old == name)
}

/// Canonical name for `name`, which is returned unchanged if it is not deprecated.
pub fn canonical_name(name: &str) -> &str {
    match lookup(name).and_then(|a| a.canonical) {
        Some(canonical) => canonical,
        None => name,
    }
}

impl DeprecatedAlias {
    /// The warning emitted whenever this alias is used.
    pub fn warning(&self) -> CompatibilityWarning {
        let message = match self.canonical {
            Some(canonical) => format!(
                "`{}` is deprecated since v{} and will be removed in v{}; use `{}` instead",
                self.old, self.since, self.removal, canonical
            ),
            None => format!(
                "`{}` has no effect since v{} and will be removed in v{}",
                self.old, self.since, self.removal
            ),
        };
        CompatibilityWarning {
            option: self.old.to_string(),
            message,
        }
    }

    /// Translate a deprecated value into the canonical option's value.
    pub fn map_value(&self, value: &Value) -> Result<Option<Value>> {
        let flag = |v: &Value| {
            v.as_bool().ok_or_else(|| {
                KilnError::misconfigured(self.old, format!("expected a boolean, got {v}"))
            })
        };
        Ok(match self.mapping {
            ValueMapping::Identity => Some(value.clone()),
            ValueMapping::AmpToPrecision => Some(Value::from(if flag(value)? { 16 } else { 32 })),
            ValueMapping::FlagToRefreshRate => Some(Value::from(if flag(value)? { 1 } else { 0 })),
            ValueMapping::Ignored => None,
        })
    }
}

/// Rewrite deprecated keys in `options` onto their canonical keys.
///
/// A canonical key that is already present always wins; the deprecated value
/// is only copied when the canonical key is absent. Every deprecated key
/// produces exactly one warning and is removed from the map.
pub fn resolve_aliases(options: &mut Map<String, Value>) -> Result<Vec<CompatibilityWarning>> {
    let mut warnings = Vec::new();
    for alias in DEPRECATED_ALIASES {
        let Some(value) = options.remove(alias.old) else {
            continue;
        };
        warnings.push(alias.warning());

        let Some(canonical) = alias.canonical else {
            continue;
        };
        let mapped = alias.map_value(&value)?;
        if options.contains_key(canonical) {
            tracing::debug!(
                deprecated = alias.old,
                canonical,
                "canonical option set explicitly, ignoring deprecated value"
            );
            continue;
        }
        if let Some(mapped) = mapped {
            options.insert(canonical.to_string(), mapped);
        }
    }
    Ok(warnings)
}
