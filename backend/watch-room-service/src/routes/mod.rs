use actix_web::{web, HttpResponse};

use crate::metrics::metrics_handler;

pub mod rooms;
pub mod wsroute;

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler))
        .service(rooms::create_room)
        .service(rooms::list_rooms)
        .service(rooms::get_room)
        .service(rooms::join_room)
        .service(rooms::leave_room)
        .service(rooms::delete_room)
        .service(wsroute::ws_handler);
}
