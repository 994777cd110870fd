//! Analyzer configuration: strict JSON schema, version-gated.

use serde::Deserialize;
use stackmax_elf::Image;

use crate::ConfigError;

/// Supported schema version.
pub const CONFIG_VERSION: u32 = 1;

/// Number of configurable priority groups (two NVIC priority bits on
/// Cortex-M0).
pub const PRIORITY_GROUPS: u8 = 4;

/// Top-level config file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub stack_depth_analyzer_version: Option<u32>,
    #[serde(default)]
    pub entrypoints: EntrypointsConfig,
    #[serde(default)]
    pub dynamic_calls: Vec<DynamicCallHint>,
}

/// Per-vector enablement and priorities.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntrypointsConfig {
    /// Symbol the program uses for unused vectors; `null` enables
    /// autodetection.
    #[serde(default)]
    pub default_handler: Option<String>,
    #[serde(default)]
    pub nmi: ExceptionSetting,
    #[serde(default)]
    pub svcall: ExceptionSetting,
    #[serde(default)]
    pub pendsv: ExceptionSetting,
    #[serde(default)]
    pub systick: ExceptionSetting,
    #[serde(default)]
    pub interrupts: Vec<InterruptConfig>,
}

/// Exception state: a priority group, a plain enable/disable, or `null` for
/// autodetection against the default handler.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ExceptionSetting {
    Priority(i64),
    Enabled(bool),
    #[default]
    Auto,
}

/// One external interrupt line.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterruptConfig {
    pub number: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: InterruptSetting,
}

/// Interrupt state, mirroring [`ExceptionSetting`] with the detailed form.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InterruptSetting {
    Detailed(InterruptDetail),
    Enabled(bool),
    #[default]
    Auto,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InterruptDetail {
    pub priority_group: Option<i64>,
}

/// Resolution hint for one indirect call or computed branch site.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicCallHint {
    /// `"0x<hex>"` absolute address, or `"<symbol>+<offset>"`.
    pub site: String,
    pub targets: Vec<String>,
}

impl Config {
    /// Parse and validate a config file.
    ///
    /// # Errors
    ///
    /// Rejects unknown fields, unsupported versions, and out-of-range
    /// priorities or interrupt numbers.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.stack_depth_analyzer_version {
            None | Some(CONFIG_VERSION) => {}
            Some(version) => return Err(ConfigError::UnsupportedVersion(version)),
        }

        for setting in [
            self.entrypoints.nmi,
            self.entrypoints.svcall,
            self.entrypoints.pendsv,
            self.entrypoints.systick,
        ] {
            if let ExceptionSetting::Priority(group) = setting {
                check_priority_group(group)?;
            }
        }

        let mut numbers = Vec::new();
        for interrupt in &self.entrypoints.interrupts {
            if !(0..32).contains(&interrupt.number) {
                return Err(ConfigError::BadInterruptNumber(interrupt.number));
            }
            let number = interrupt.number as u32;
            if numbers.contains(&number) {
                return Err(ConfigError::DuplicateInterrupt(number));
            }
            numbers.push(number);

            if let InterruptSetting::Detailed(InterruptDetail {
                priority_group: Some(group),
            }) = interrupt.config
            {
                check_priority_group(group)?;
            }
        }

        let mut sites = Vec::new();
        for hint in &self.dynamic_calls {
            if hint.targets.is_empty() {
                return Err(ConfigError::EmptyTargets(hint.site.clone()));
            }
            parse_site(&hint.site)?;
            if sites.contains(&hint.site) {
                return Err(ConfigError::DuplicateCallSite(hint.site.clone()));
            }
            sites.push(hint.site.clone());
        }

        Ok(())
    }

    /// Resolve each hint's site and targets to absolute function addresses.
    ///
    /// # Errors
    ///
    /// Any symbol named by a hint must exist in the image.
    pub fn resolve_hints(&self, image: &Image) -> Result<Vec<ResolvedHint>, ConfigError> {
        let mut resolved = Vec::with_capacity(self.dynamic_calls.len());

        for hint in &self.dynamic_calls {
            let site = match parse_site(&hint.site)? {
                SiteRef::Address(address) => address,
                SiteRef::Symbolic { name, offset } => {
                    let func = image
                        .function_by_name(&name)
                        .ok_or_else(|| ConfigError::UnknownSymbol(name.clone()))?;
                    func.address + offset
                }
            };

            let mut targets = Vec::with_capacity(hint.targets.len());
            for name in &hint.targets {
                let func = image
                    .function_by_name(name)
                    .ok_or_else(|| ConfigError::UnknownSymbol(name.clone()))?;
                targets.push(func.address);
            }

            resolved.push(ResolvedHint { site, targets });
        }

        Ok(resolved)
    }
}

fn check_priority_group(group: i64) -> Result<(), ConfigError> {
    if (0..i64::from(PRIORITY_GROUPS)).contains(&group) {
        Ok(())
    } else {
        Err(ConfigError::BadPriorityGroup(group))
    }
}

/// A hint with its site and targets resolved to addresses.
#[derive(Clone, Debug)]
pub struct ResolvedHint {
    pub site: u32,
    pub targets: Vec<u32>,
}

enum SiteRef {
    Address(u32),
    Symbolic { name: String, offset: u32 },
}

fn parse_site(site: &str) -> Result<SiteRef, ConfigError> {
    let bad = || ConfigError::BadCallSite(site.to_string());

    if let Some(hex) = site.strip_prefix("0x") {
        let address = u32::from_str_radix(hex, 16).map_err(|_| bad())?;
        return Ok(SiteRef::Address(address));
    }

    let (name, offset) = site.split_once('+').ok_or_else(bad)?;
    if name.is_empty() {
        return Err(bad());
    }
    let offset = if let Some(hex) = offset.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).map_err(|_| bad())?
    } else {
        offset.parse::<u32>().map_err(|_| bad())?
    };

    Ok(SiteRef::Symbolic {
        name: name.to_string(),
        offset,
    })
}
