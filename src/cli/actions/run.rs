use crate::cli::actions::Action;
use crate::exporter;
use anyhow::Result;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the exporter fails to start
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run { settings } => {
            exporter::new(settings).await?;
        }
    }

    Ok(())
}
