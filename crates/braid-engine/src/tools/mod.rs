pub mod external_cli;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use braid_core::settings::ToolSettings;

use crate::registry::ToolRegistry;
use crate::thread_cache::ToolThreadCache;

/// Registry of the built-in tools enabled by settings.
pub fn create_default_registry(settings: &ToolSettings, threads: &ToolThreadCache) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    if let Some(cli) = &settings.external_cli {
        registry.register(Arc::new(external_cli::ExternalCliTool::new(cli, threads.clone())));
    }

    registry
}
