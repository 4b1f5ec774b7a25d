use anyhow::Context;
use clap::Args;
use tracing::info;
use weaver_core::app::Role;

use super::DatabaseArgs;

#[derive(Args)]
pub struct MigrateCommand {
    #[command(flatten)]
    db: DatabaseArgs,
}

impl MigrateCommand {
    pub async fn execute(self) -> anyhow::Result<()> {
        let backends = self.db.connect()?;
        // schema がまだ無いので liveness だけ待つ
        self.db
            .plan(Role::Migrator, &backends)
            .wait()
            .await
            .context("datastore never became reachable")?;

        backends
            .datastore
            .migrate()
            .await
            .context("migration failed")?;
        info!("migrations applied");
        Ok(())
    }
}
