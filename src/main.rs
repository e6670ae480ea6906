use std::error::Error;

use taskdesk::config::Settings;
use taskdesk::persist::SaveFile;
use taskdesk::routes;
use taskdesk::state::AppState;

fn init_tracing() {
    #[cfg(feature = "profile-console")]
    {
        console_subscriber::init();
    }
    #[cfg(not(feature = "profile-console"))]
    {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let settings = Settings::load()?;

    // ── Boot the World ─────────────────────────────────────────
    let save_file = SaveFile::open(&settings.data_path)?;
    let mut world = save_file.load_world()?;

    let seeded = save_file.ensure_default_roles(&mut world)?;
    if seeded > 0 {
        tracing::info!(count = seeded, "seeded default roles");
    }
    if save_file.ensure_default_user(&mut world, &settings.default_admin_email, &settings.default_admin_password)? {
        tracing::warn!(email = %settings.default_admin_email, "created default admin user; change its password");
    }
    if settings.jwt_secret == Settings::default().jwt_secret {
        tracing::warn!("JWT_SECRET is not set; using the built-in development secret");
    }

    tracing::info!(
        tasks = world.tasks.len(),
        users = world.users.len(),
        departments = world.departments.len(),
        feedbacks = world.feedbacks.len(),
        revision = world.revision,
        "world loaded"
    );

    // ── Serve ──────────────────────────────────────────────────
    let addr = settings.socket_addr();
    let state = AppState::new(world, save_file, settings);
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
