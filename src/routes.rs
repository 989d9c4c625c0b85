use crate::handlers;
use actix_web::web;

/// API routes mounted under /api
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/pathways/{name}/run")
            .route(web::post().to(handlers::pathways::run_pathway)),
    )
    .service(
        web::resource("/requests/{id}/events")
            .route(web::get().to(handlers::requests::progress_events)),
    )
    .service(
        web::resource("/requests/{id}/cancel")
            .route(web::post().to(handlers::requests::cancel_request)),
    )
    .service(
        web::resource("/callbacks/{callbackId}")
            .route(web::post().to(handlers::requests::resolve_callback)),
    )
    .service(
        web::scope("/dynamic")
            .service(
                web::resource("")
                    .route(web::get().to(handlers::dynamic::list_pathways)),
            )
            .service(
                web::resource("/{userId}/{name}/run")
                    .route(web::post().to(handlers::pathways::run_dynamic_pathway)),
            )
            .service(
                web::resource("/{userId}/{name}")
                    .route(web::put().to(handlers::dynamic::publish_pathway))
                    .route(web::delete().to(handlers::dynamic::delete_pathway))
                    .route(web::get().to(handlers::dynamic::get_pathway)),
            ),
    );
}
