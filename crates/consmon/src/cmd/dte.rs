use consmon_db::{StoreConfig, CONFIG_DB};
use consmon_link::{resolve_uart, Sender};
use tracing::info;

use crate::cmd::{connect_store, install_signal_handlers, DteArgs};
use crate::exit::{db_error, link_error, CliResult, SUCCESS};

pub fn run(args: DteArgs) -> CliResult<i32> {
    let stop = install_signal_handlers()?;

    let (device, baud) = resolve_uart(args.device, args.baud)
        .map_err(|err| link_error("resolving console uart", err))?;
    info!(device = %device.display(), baud, "console uart resolved");

    let topology = StoreConfig::load(&args.db_config)
        .map_err(|err| db_error("loading database topology", err))?;
    let config_store = connect_store(&topology, CONFIG_DB)?;

    Sender::new(device, baud, config_store)
        .run(stop)
        .map_err(|err| link_error("heartbeat sender", err))?;

    Ok(SUCCESS)
}
