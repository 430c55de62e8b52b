#[tokio::main]
async fn main() {
    spotify_refresh_token_lib::shared::logging::init();

    // Unlocked handles: listener tasks log to stderr from other threads while this waits.
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let end = spotify_refresh_token_lib::session::run_from_env(&mut stdout, &mut stderr).await;

    std::process::exit(end.exit_code());
}
