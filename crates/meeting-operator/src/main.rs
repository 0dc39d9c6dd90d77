use clap::Parser;
use meeting_operator::{
    cli::{Command, RunArguments},
    client::Client,
    controller,
    crd::AutoScaler,
    logging::{self, Tracing},
    target::TargetKind,
    utils::signal::{SignalError, SignalWatcher},
    yaml::{self, CustomResourceExt as _},
};
use snafu::{ResultExt, Snafu};

const APP_NAME: &str = "meeting-operator";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print the CRD"))]
    PrintCrd { source: yaml::Error },

    #[snafu(display("failed to initialize tracing"))]
    InitTracing { source: logging::Error },

    #[snafu(display("failed to create the Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to watch for termination signals"))]
    WatchSignals { source: SignalError },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    match Command::parse() {
        Command::Crd => AutoScaler::print_yaml_schema().context(PrintCrdSnafu),
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArguments) -> Result<(), Error> {
    // Kept alive until the controller returns, dropping it flushes the exporters
    let _tracing_guard = Tracing::pre_configured(APP_NAME, args.telemetry.clone())
        .init()
        .context(InitTracingSnafu)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        field_manager = %args.field_manager,
        "starting {APP_NAME}"
    );

    let shutdown = SignalWatcher::termination().context(WatchSignalsSnafu)?;
    let kube_client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let client = Client::new(kube_client, &args.field_manager, TargetKind::jvb());

    controller::run(client, args.controller_options(), shutdown.handle()).await;

    tracing::info!("controller stopped");
    Ok(())
}
