use clap::Parser;

fn main() {
    let cli = reelsmithctl::Cli::parse();
    if let Err(err) = reelsmithctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
