use clap::Parser;

fn main() {
    let cli = talkreelctl::Cli::parse();
    if let Err(err) = talkreelctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
