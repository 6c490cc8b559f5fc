use anyhow::Result;
use ottoapi::{MacroDispatch, MacroRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        anyhow::bail!("usage: {} <backend-url> <ottoeject-id> <macro>", args[0]);
    }

    let client = ottoapi::Client::new(&args[1])?;
    let id: u64 = args[2].parse()?;

    eprintln!("Dispatching {}", args[3]);
    match client.execute_macro(id, &MacroRequest::new(&args[3])).await? {
        MacroDispatch::Accepted { status } => eprintln!("Accepted ({})", status),
        MacroDispatch::AckTimeout { message } => eprintln!("Presumed dispatched: {}", message),
    }

    let status = client.ejector_status(id).await?;
    eprintln!("Ejector status: {}", status.status);

    Ok(())
}
