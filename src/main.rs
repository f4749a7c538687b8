#[macro_use]
extern crate diesel_migrations;

use tokio::signal;
use warp::Filter;

use chapterwatch::config::Config;
use chapterwatch::context::AppCtx;
use chapterwatch::kv::heartbeat;
use chapterwatch::queue::worker;
use chapterwatch::{api, scheduler, telemetry};

embed_migrations!("migrations");

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    std::env::set_var("TZ", "UTC");
    telemetry::init_tracing();

    let config = Config::from_env().expect("Failed to read configuration from the environment.");
    let port = config.bind_port;
    let ctx = AppCtx::initialize(config)
        .await
        .expect("Failed to initialize application context.");

    {
        let conn = ctx
            .db
            .conn()
            .await
            .expect("Failed to acquire a connection for migrations.");
        embedded_migrations::run(&*conn).expect("Failed to run database migrations.");
    }

    let server = warp::serve(api::routes(ctx.clone()).with(warp::trace::request()))
        .run(([0, 0, 0, 0], port));
    let workers = worker::run_worker_pool(ctx.clone());
    let scheduler = scheduler::scheduler_loop(ctx.clone());
    let heartbeat = heartbeat::heartbeat_loop(ctx.kv.clone());
    let cancel = signal::ctrl_c();

    tokio::select! {
        _ = server => 0,
        _ = workers => 0,
        _ = scheduler => 0,
        _ = heartbeat => 0,
        _ = cancel => { println!("Received exit signal, exiting."); 255 }
    };
}
