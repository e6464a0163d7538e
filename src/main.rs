use urdf_studio::cli::Cli;
use urdf_studio::logging::init_logger;

fn main() {
    let cli = match Cli::parse(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => {
            if let Some(clap_err) = err.downcast_ref::<clap::Error>() {
                clap_err.exit();
            }
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    init_logger();
    if let Err(err) = urdf_studio::run(cli) {
        log::error!("Application error: {err:?}");
        std::process::exit(1);
    }
}
