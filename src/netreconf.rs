//! Network reconfiguration through per-interface helper scripts.
//!
//! The helper is invoked as
//! `script <primary|secondary> <install|uninstall> <nic> <ifname> <index>`.
//! On the secondary the interface's stand-alone configuration is removed with
//! `if_down` before install and restored with `if_up` after uninstall.

use crate::collaborators::NetworkReconfig;
use crate::error::NetReconfigError;
use crate::session::Role;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicBinding {
    pub nic_name: String,
    pub if_name: String,
    pub script: String,
    #[serde(default)]
    pub if_up: Option<String>,
    #[serde(default)]
    pub if_down: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    Install,
    Uninstall,
}

impl ScriptAction {
    fn label(self) -> &'static str {
        match self {
            ScriptAction::Install => "install",
            ScriptAction::Uninstall => "uninstall",
        }
    }
}

/// Builds the helper's argument vector, rejecting empty arguments.
pub fn script_argv(
    binding: &NicBinding,
    role: Role,
    action: ScriptAction,
    index: u32,
) -> Result<Vec<String>, NetReconfigError> {
    let argv = vec![
        ("script", binding.script.clone()),
        ("role", role.label().to_string()),
        ("action", action.label().to_string()),
        ("nic_name", binding.nic_name.clone()),
        ("if_name", binding.if_name.clone()),
        ("index", index.to_string()),
    ];
    argv.into_iter()
        .map(|(argument, value)| {
            if value.is_empty() {
                Err(NetReconfigError::MissingArgument {
                    nic: binding.nic_name.clone(),
                    argument,
                })
            } else {
                Ok(value)
            }
        })
        .collect()
}

fn run(argv: &[String]) -> Result<(), NetReconfigError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(NetReconfigError::EmptyCommand);
    };
    debug!("event=colo_nic_script_launch argv={argv:?}");
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|source| NetReconfigError::Launch {
            script: program.clone(),
            source,
        })?;
    if !status.success() {
        return Err(NetReconfigError::ScriptFailed {
            script: program.clone(),
            status: status.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug)]
struct BindingState {
    binding: NicBinding,
    installed: bool,
}

pub struct ScriptNetworkReconfig {
    bindings: Mutex<Vec<BindingState>>,
    index: u32,
}

impl ScriptNetworkReconfig {
    /// Uses the current process id as the helper's index argument.
    pub fn new(bindings: Vec<NicBinding>) -> Self {
        Self::with_index(bindings, std::process::id())
    }

    pub fn with_index(bindings: Vec<NicBinding>, index: u32) -> Self {
        Self {
            bindings: Mutex::new(
                bindings
                    .into_iter()
                    .map(|binding| BindingState {
                        binding,
                        installed: false,
                    })
                    .collect(),
            ),
            index,
        }
    }

    pub fn installed(&self, nic_name: &str) -> bool {
        self.bindings
            .lock()
            .iter()
            .any(|state| state.binding.nic_name == nic_name && state.installed)
    }

    fn configure(
        &self,
        binding: &NicBinding,
        role: Role,
        action: ScriptAction,
    ) -> Result<(), NetReconfigError> {
        let argv = script_argv(binding, role, action, self.index)?;
        if role == Role::Primary {
            return run(&argv);
        }
        let (if_up, if_down) = match (&binding.if_up, &binding.if_down) {
            (Some(up), Some(down)) if !up.is_empty() && !down.is_empty() => (up, down),
            _ => {
                return Err(NetReconfigError::MissingStandaloneScripts {
                    nic: binding.nic_name.clone(),
                })
            }
        };
        match action {
            ScriptAction::Install => {
                run(&[if_down.clone(), binding.if_name.clone()])?;
                run(&argv)
            }
            ScriptAction::Uninstall => {
                run(&argv)?;
                run(&[if_up.clone(), binding.if_name.clone()])
            }
        }
    }
}

impl NetworkReconfig for ScriptNetworkReconfig {
    fn apply(&self, role: Role) -> Result<(), NetReconfigError> {
        let mut bindings = self.bindings.lock();
        if bindings.is_empty() {
            return Err(NetReconfigError::NoBindings);
        }
        for state in bindings.iter_mut() {
            if state.installed {
                continue;
            }
            self.configure(&state.binding, role, ScriptAction::Install)?;
            state.installed = true;
            info!(
                "event=colo_nic_installed nic={} if_name={} role={}",
                state.binding.nic_name, state.binding.if_name, role
            );
        }
        Ok(())
    }

    fn revert(&self, role: Role) -> Result<(), NetReconfigError> {
        let mut bindings = self.bindings.lock();
        let mut first_err = None;
        for state in bindings.iter_mut() {
            if !state.installed {
                continue;
            }
            // the binding is torn down whatever the helper reports
            let outcome = self.configure(&state.binding, role, ScriptAction::Uninstall);
            state.installed = false;
            match outcome {
                Ok(()) => {
                    info!(
                        "event=colo_nic_uninstalled nic={} role={}",
                        state.binding.nic_name, role
                    );
                }
                Err(err) => {
                    warn!(
                        "event=colo_nic_uninstall_error nic={} error={}",
                        state.binding.nic_name, err
                    );
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
