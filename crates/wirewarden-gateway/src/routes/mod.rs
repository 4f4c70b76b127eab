pub mod acl_routes;
pub mod domain_routes;
pub mod firewall_routes;
pub mod login;
pub mod peer_routes;
pub mod ws_routes;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    peer_routes::configure(cfg);
    firewall_routes::configure(cfg);
    acl_routes::configure(cfg);
    domain_routes::configure(cfg);
    ws_routes::configure(cfg);
    login::configure(cfg);
}
