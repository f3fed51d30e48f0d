use std::sync::Arc;

use consmon_db::{StoreConfig, CONFIG_DB, STATE_DB};
use consmon_link::{read_udev_prefix, StoreStatePublisher, Supervisor};
use tracing::info;

use crate::cmd::{connect_store, install_signal_handlers, DceArgs};
use crate::exit::{db_error, link_error, CliResult, SUCCESS};

pub fn run(args: DceArgs) -> CliResult<i32> {
    let stop = install_signal_handlers()?;

    let topology = StoreConfig::load(&args.db_config)
        .map_err(|err| db_error("loading database topology", err))?;
    let config_store = connect_store(&topology, CONFIG_DB)?;
    let state_store = connect_store(&topology, STATE_DB)?;

    let prefix = read_udev_prefix(&args.platform_dir);
    info!(prefix = %prefix, "console device prefix");

    let publisher = Arc::new(StoreStatePublisher::new(state_store));
    let mut supervisor = Supervisor::new(config_store, publisher, prefix, args.dev_dir);

    // Disabled at startup is a clean no-op exit; a flip to disabled while
    // running is handled inside the supervisor loop.
    if !supervisor
        .feature_enabled()
        .map_err(|err| link_error("reading enable flag", err))?
    {
        info!("console management is disabled, exiting");
        return Ok(SUCCESS);
    }

    supervisor
        .run(stop)
        .map_err(|err| link_error("supervisor", err))?;

    Ok(SUCCESS)
}
