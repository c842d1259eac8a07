use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use avr_gdb_server::config::{ProjectConfig, ToolConfig, DEFAULT_ENVIRONMENT};
use avr_gdb_server::controller::{EventBus, TargetController, TargetControllerService};
use avr_gdb_server::error::Error;
use avr_gdb_server::gdb_server::{GdbServer, WakeHandle};
use avr_gdb_server::probe::edbg::EdbgAvr8Interface;
use avr_gdb_server::probe::fake::FakeProbe;
use avr_gdb_server::probe::WireTransport;
use avr_gdb_server::target::avr8::Avr8;
use avr_gdb_server::target::provider::{
    BuiltinDescriptorProvider, DescriptorProvider, YamlDescriptorProvider,
};

#[derive(Parser)]
#[command(
    name = "avr-gdb-server",
    about = "GDB remote serial protocol server for AVR targets behind EDBG debug probes",
    version
)]
struct Cli {
    /// Path to the project configuration file
    #[arg(long, default_value = "avr-gdb-server.yaml")]
    config: PathBuf,

    /// Name of the environment to select from the configuration file
    #[arg(long, default_value = DEFAULT_ENVIRONMENT)]
    env: String,

    /// Enable verbose debug logging
    #[arg(long)]
    debug: bool,
}

// Exit codes: 1 configuration error, 2 tool/target activation failure,
// 3 runtime failure.
fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(exit) => exit,
    }
}

fn run(cli: Cli) -> Result<(), ExitCode> {
    let config = ProjectConfig::load(&cli.config).map_err(|error| {
        eprintln!("Failed to load project configuration: {error}");
        ExitCode::from(1)
    })?;

    if cli.debug || config.debug_logging {
        std::env::set_var(
            "RUST_LOG",
            std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".into()),
        );
    }
    pretty_env_logger::init();

    let resolved = config.environment(&cli.env).map_err(|error| {
        eprintln!("{error}");
        ExitCode::from(1)
    })?;
    let target_config = &resolved.environment.target;

    let descriptor = match &target_config.device_spec_directory {
        Some(directory) => YamlDescriptorProvider::new(directory).descriptor(&target_config.name),
        None => BuiltinDescriptorProvider.descriptor(&target_config.name),
    }
    .map_err(|error| {
        eprintln!("Failed to load the target descriptor: {error}");
        ExitCode::from(1)
    })?;
    let descriptor = Arc::new(descriptor);

    let transport: Box<dyn WireTransport> = match resolved.environment.tool {
        ToolConfig::Simulator => {
            log::info!("Using the simulated debug probe");
            Box::new(FakeProbe::from_descriptor(&descriptor))
        }
    };

    let interface = EdbgAvr8Interface::new(
        transport,
        target_config.avr8_config(),
        descriptor.family,
        descriptor.parameters.clone(),
    )
    .map_err(exit_for)?;

    let target = Avr8::new(
        Arc::clone(&descriptor),
        interface,
        target_config.avr8_config(),
        true,
    );

    let events = Arc::new(EventBus::new());
    let (controller, queue) = TargetController::new(target, Arc::clone(&events));
    let controller_thread = controller.spawn();

    let service = TargetControllerService::new(queue);
    service.resume().map_err(|error| {
        eprintln!("Failed to activate the debug tool and target: {error}");
        ExitCode::from(2)
    })?;
    log::info!("Target \"{}\" activated", descriptor.name);

    let server = GdbServer::new(
        service.clone(),
        events,
        resolved.server.bind_address(),
        target_config.release_post_session,
    );

    let result = server.run(WakeHandle::new()).map_err(|error| {
        eprintln!("{error}");
        ExitCode::from(3)
    });

    if service.shutdown().is_ok() {
        let _ = controller_thread.join();
    }

    result
}

fn exit_for(error: Error) -> ExitCode {
    match error {
        Error::Config(_) | Error::InvalidArgument(_) => {
            eprintln!("{error}");
            ExitCode::from(1)
        }
        Error::DeviceInit(_) | Error::DebugWirePhysical(_) | Error::Integrity(_) => {
            eprintln!("{error}");
            ExitCode::from(2)
        }
        _ => {
            eprintln!("{error}");
            ExitCode::from(3)
        }
    }
}
