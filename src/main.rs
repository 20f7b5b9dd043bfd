mod cli;
mod env_loader;
mod logging;

fn main() {
    env_loader::load_dotenv();

    match cli::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(commsync::error::exit_code_for(&err));
        }
    }
}
