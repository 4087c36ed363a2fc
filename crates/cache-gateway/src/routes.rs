//! Route configuration

use actix_web::web;

use crate::{handlers, middleware};

/// Mount points of the cache endpoint; the second keeps edge-function clients working
pub const CACHE_PATHS: [&str; 2] = ["/api/v1/cache", "/functions/v1/api-v1-cache"];

/// Configure all routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(middleware::metrics_handler));

    for path in CACHE_PATHS {
        cfg.service(
            web::resource(path)
                .route(web::get().to(handlers::health_check))
                .route(web::post().to(handlers::execute_operation)),
        );
    }
}
