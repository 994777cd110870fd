//! Entrypoints: vector-table walk under the configured priority model.

use stackmax_elf::{Image, VectorTable};
use tracing::{info, warn};

use crate::{
    ConfigError, EntrypointError, EntrypointsConfig, ExceptionSetting, InterruptDetail,
    InterruptSetting,
};

/// Default-handler symbols emitted by the toolchains we know.
const DEFAULT_HANDLER_NAMES: &[&str] = &["DefaultHandler", "DefaultHandler_"];

/// Vector indices of the fixed system exceptions.
const VECTOR_RESET: usize = 1;
const VECTOR_NMI: usize = 2;
const VECTOR_HARDFAULT: usize = 3;
const VECTOR_SVCALL: usize = 11;
const VECTOR_PENDSV: usize = 14;
const VECTOR_SYSTICK: usize = 15;
/// First external interrupt vector.
const VECTOR_IRQ0: usize = 16;

/// Hardware priority of an entrypoint. `preempts` is a strict order: NMI
/// above HardFault above the configurable groups (lower group number first)
/// above thread level (reset).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Nmi,
    HardFault,
    Group(u8),
    Thread,
}

impl Priority {
    /// Comparable rank; lower ranks preempt higher ones.
    pub fn rank(self) -> i32 {
        match self {
            Priority::Nmi => -2,
            Priority::HardFault => -1,
            Priority::Group(group) => i32::from(group),
            Priority::Thread => i32::MAX,
        }
    }

    pub fn preempts(self, other: Priority) -> bool {
        self.rank() < other.rank()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Nmi => write!(f, "NMI"),
            Priority::HardFault => write!(f, "HardFault"),
            Priority::Group(group) => write!(f, "{group}"),
            Priority::Thread => write!(f, "thread"),
        }
    }
}

/// An asynchronous entrypoint the hardware may invoke.
#[derive(Clone, Debug)]
pub struct Entrypoint {
    pub name: String,
    pub vector_index: usize,
    /// Handler function entry address.
    pub handler: u32,
    pub priority: Priority,
}

/// Resolve the default handler: an explicit symbol, or autodetection over
/// the known toolchain names.
///
/// # Errors
///
/// An explicitly configured symbol must exist.
pub fn resolve_default_handler(
    image: &Image,
    config: &EntrypointsConfig,
) -> Result<Option<u32>, ConfigError> {
    match &config.default_handler {
        Some(name) => {
            let func = image
                .function_by_name(name)
                .ok_or_else(|| ConfigError::UnknownSymbol(name.clone()))?;
            Ok(Some(func.address))
        }
        None => {
            let matches: Vec<u32> = DEFAULT_HANDLER_NAMES
                .iter()
                .filter_map(|name| image.function_by_name(name))
                .map(|func| func.address)
                .collect();

            match matches.as_slice() {
                [address] => {
                    info!(address = format_args!("{address:#06x}"), "autodetected default handler");
                    Ok(Some(*address))
                }
                [] => {
                    warn!("no default handler found; vector autodetection disabled");
                    Ok(None)
                }
                _ => {
                    warn!("multiple default handler candidates; vector autodetection disabled");
                    Ok(None)
                }
            }
        }
    }
}

/// Walk the vector table and produce the enabled entrypoints under the
/// config's enablement and priority settings.
///
/// # Errors
///
/// Reset and the fixed system exceptions must be present, and every used
/// vector must point at a known function.
pub fn resolve_entrypoints(
    image: &Image,
    vector_table: &VectorTable,
    config: &EntrypointsConfig,
    default_handler: Option<u32>,
) -> Result<Vec<Entrypoint>, EntrypointError> {
    let mut entrypoints = Vec::new();
    let resolver = Resolver {
        image,
        default_handler,
    };

    let word_count = vector_table.handlers.len() + 1;
    for index in 1..word_count {
        let handler = vector_table.handler(index);

        match index {
            VECTOR_RESET => {
                let handler = resolver.require(index, handler, "Reset")?;
                entrypoints.push(Entrypoint {
                    name: "Reset".to_string(),
                    vector_index: index,
                    handler,
                    priority: Priority::Thread,
                });
            }
            VECTOR_NMI => {
                let handler = resolver.require(index, handler, "NMI")?;
                if let Some(priority) =
                    resolver.exception_priority("NMI", handler, config.nmi, Priority::Nmi)
                {
                    entrypoints.push(Entrypoint {
                        name: "NMI".to_string(),
                        vector_index: index,
                        handler,
                        priority,
                    });
                }
            }
            VECTOR_HARDFAULT => {
                let handler = resolver.require(index, handler, "HardFault")?;
                // HardFault cannot be disabled or reprioritized
                resolver.warn_if_default("HardFault", handler);
                entrypoints.push(Entrypoint {
                    name: "HardFault".to_string(),
                    vector_index: index,
                    handler,
                    priority: Priority::HardFault,
                });
            }
            VECTOR_SVCALL | VECTOR_PENDSV | VECTOR_SYSTICK => {
                let (name, setting) = match index {
                    VECTOR_SVCALL => ("SVCall", config.svcall),
                    VECTOR_PENDSV => ("PendSV", config.pendsv),
                    _ => ("SysTick", config.systick),
                };
                let handler = resolver.require(index, handler, name)?;
                if let Some(priority) =
                    resolver.configurable_priority(name, handler, setting)
                {
                    entrypoints.push(Entrypoint {
                        name: name.to_string(),
                        vector_index: index,
                        handler,
                        priority,
                    });
                }
            }
            _ if index < VECTOR_IRQ0 => {
                // reserved system slots
                if let Some(address) = handler {
                    warn!(
                        index,
                        address = format_args!("{address:#06x}"),
                        "reserved vector points at a function"
                    );
                }
            }
            _ => {
                let number = (index - VECTOR_IRQ0) as u32;
                let interrupt = config
                    .interrupts
                    .iter()
                    .find(|interrupt| interrupt.number == i64::from(number));

                let Some(address) = handler else {
                    if interrupt.is_some() {
                        warn!(number, "configured interrupt has no vector table entry");
                    }
                    continue;
                };
                let func = resolver.function(index, address)?;

                let name = interrupt
                    .and_then(|interrupt| interrupt.name.clone())
                    .unwrap_or_else(|| func.display_name());
                let setting = interrupt
                    .map(|interrupt| interrupt.config.clone())
                    .unwrap_or_default();

                if let Some(priority) = resolver.interrupt_priority(&name, address, &setting) {
                    entrypoints.push(Entrypoint {
                        name,
                        vector_index: index,
                        handler: address,
                        priority,
                    });
                }
            }
        }
    }

    Ok(entrypoints)
}

struct Resolver<'a> {
    image: &'a Image,
    default_handler: Option<u32>,
}

impl Resolver<'_> {
    fn function(&self, index: usize, address: u32) -> Result<&stackmax_elf::FuncSym, EntrypointError> {
        self.image
            .function_at(address)
            .ok_or(EntrypointError::VectorNotAFunction { index, address })
    }

    fn require(
        &self,
        index: usize,
        handler: Option<u32>,
        name: &'static str,
    ) -> Result<u32, EntrypointError> {
        let address = handler.ok_or(EntrypointError::MissingVector(name))?;
        self.function(index, address)?;
        Ok(address)
    }

    fn is_default(&self, handler: u32) -> bool {
        self.default_handler == Some(handler)
    }

    fn warn_if_default(&self, name: &str, handler: u32) {
        if self.is_default(handler) {
            warn!(name, "enabled entrypoint points at the default handler");
        }
    }

    fn warn_if_not_default(&self, name: &str, handler: u32) {
        if self.default_handler.is_some() && !self.is_default(handler) {
            warn!(name, "disabled entrypoint points at a dedicated handler");
        }
    }

    /// Fixed-priority exception (NMI): the config can only enable or disable
    /// it; a configured group number is ignored.
    fn exception_priority(
        &self,
        name: &str,
        handler: u32,
        setting: ExceptionSetting,
        fixed: Priority,
    ) -> Option<Priority> {
        match setting {
            ExceptionSetting::Enabled(false) => {
                self.warn_if_not_default(name, handler);
                None
            }
            ExceptionSetting::Enabled(true) => {
                self.warn_if_default(name, handler);
                Some(fixed)
            }
            ExceptionSetting::Priority(_) => {
                warn!(name, "priority group ignored for a fixed-priority exception");
                self.warn_if_default(name, handler);
                Some(fixed)
            }
            ExceptionSetting::Auto => {
                if self.is_default(handler) {
                    None
                } else {
                    if self.default_handler.is_none() {
                        warn!(name, "no default handler; assuming the exception is used");
                    }
                    Some(fixed)
                }
            }
        }
    }

    /// Configurable exception (SVCall/PendSV/SysTick).
    fn configurable_priority(
        &self,
        name: &str,
        handler: u32,
        setting: ExceptionSetting,
    ) -> Option<Priority> {
        match setting {
            ExceptionSetting::Enabled(false) => {
                self.warn_if_not_default(name, handler);
                None
            }
            ExceptionSetting::Priority(group) => {
                self.warn_if_default(name, handler);
                Some(Priority::Group(group as u8))
            }
            ExceptionSetting::Enabled(true) => {
                self.warn_if_default(name, handler);
                warn!(name, "no priority group; assuming the worst case (group 0)");
                Some(Priority::Group(0))
            }
            ExceptionSetting::Auto => {
                if self.is_default(handler) {
                    None
                } else {
                    if self.default_handler.is_none() {
                        warn!(name, "no default handler; assuming the exception is used");
                    }
                    warn!(name, "no priority group; assuming the worst case (group 0)");
                    Some(Priority::Group(0))
                }
            }
        }
    }

    fn interrupt_priority(
        &self,
        name: &str,
        handler: u32,
        setting: &InterruptSetting,
    ) -> Option<Priority> {
        match setting {
            InterruptSetting::Enabled(false) => {
                self.warn_if_not_default(name, handler);
                None
            }
            InterruptSetting::Detailed(InterruptDetail {
                priority_group: Some(group),
            }) => {
                self.warn_if_default(name, handler);
                Some(Priority::Group(*group as u8))
            }
            InterruptSetting::Detailed(InterruptDetail {
                priority_group: None,
            })
            | InterruptSetting::Enabled(true) => {
                self.warn_if_default(name, handler);
                warn!(name, "no priority group; assuming the worst case (group 0)");
                Some(Priority::Group(0))
            }
            InterruptSetting::Auto => {
                if self.is_default(handler) {
                    None
                } else {
                    if self.default_handler.is_none() {
                        warn!(name, "no default handler; assuming the interrupt is used");
                    }
                    warn!(name, "no priority group; assuming the worst case (group 0)");
                    Some(Priority::Group(0))
                }
            }
        }
    }
}
