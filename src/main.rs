#[tokio::main]
async fn main() -> std::process::ExitCode {
    match output_tool::run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("output-tool: {error}");
            std::process::ExitCode::FAILURE
        }
    }
}
