use std::sync::Arc;
use tracing::{info, Level};
use yodel::config::Config;
use yodel::domain::presence::InMemoryPidfStore;
use yodel::domain::shared::clock::{Clock, SystemClock};
use yodel::domain::shared::value_objects::NumberClass;
use yodel::domain::user::{InMemoryUserDirectory, UserDirectory};
use yodel::infrastructure::protocols::sip::policy::{
    IdentityRewriter, NumberRewriter, PrefixRewriter,
};
use yodel::infrastructure::protocols::sip::presence_handler::PublishLimits;
use yodel::infrastructure::protocols::sip::{
    AddressPolicy, AdmissionController, ClassRules, CredentialsVerifier, DefaultLocations,
    DigestEngine, EtagGenerator, EventServer, PresenceProcessor, ProxyServer, ProxyServerConfig,
    Registrar, RoutingEngine, RoutingEngineConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting yodel SIP proxy");

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    info!(
        "Configuration loaded ({} homedomains, {} users)",
        config.sip.domains.len(),
        config.users.len()
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // User database from the static configuration
    let mut directory = InMemoryUserDirectory::new();
    for user in &config.users {
        directory.add_user(
            &user.username,
            &user.password,
            user.addresses.clone(),
            user.classes
                .iter()
                .map(|c| NumberClass::from_name(c))
                .collect(),
        );
    }
    let directory: Arc<dyn UserDirectory> = Arc::new(directory);

    // Destination classification, compiled once
    let class_rules = Arc::new(ClassRules::compile(&config.auth.classes)?);
    let unauth_classes: Vec<NumberClass> = config
        .auth
        .unauth_classes
        .iter()
        .map(|c| NumberClass::from_name(c))
        .collect();

    let rewriter: Arc<dyn NumberRewriter> = match &config.sip.e164_country_code {
        Some(country_code) => Arc::new(PrefixRewriter::new(country_code.clone())),
        None => Arc::new(IdentityRewriter),
    };

    // Authentication substrate
    let digest = Arc::new(DigestEngine::new(
        config.auth.realm.clone(),
        config.auth.secret.clone(),
        clock.clone(),
    ));
    let verifier = Arc::new(CredentialsVerifier::new(
        digest.clone(),
        directory.clone(),
        config.auth.peer_secret.clone(),
        clock.clone(),
    ));
    let admission = Arc::new(AdmissionController::new(
        verifier.clone(),
        AddressPolicy::new(directory.clone()),
        directory.clone(),
        digest.clone(),
        rewriter,
        unauth_classes,
    ));

    // Routing over the in-memory location store
    let registrar = Arc::new(Registrar::new(clock.clone()));
    let locations = Arc::new(DefaultLocations::new(registrar.clone(), directory.clone()));
    let local_host = config
        .sip
        .domains
        .first()
        .cloned()
        .unwrap_or_else(|| "localhost".to_string());
    let routing = Arc::new(RoutingEngine::new(
        RoutingEngineConfig {
            homedomains: config.sip.domains.clone(),
            record_route: config.sip.record_route,
            local_host: local_host.clone(),
            always_verify_homedomain_user: config.auth.always_verify_homedomain_user,
            peer_secret: config.auth.peer_secret.clone(),
        },
        digest.clone(),
        verifier.clone(),
        admission,
        AddressPolicy::new(directory.clone()),
        locations,
        registrar,
        class_rules,
    ));

    // Presence event package
    let store = Arc::new(InMemoryPidfStore::new(clock.clone()));
    let processor = Arc::new(PresenceProcessor::new(
        store,
        EtagGenerator::new(local_host, clock.clone()),
        PublishLimits::from(&config.presence),
        clock.clone(),
    ));
    let events = Arc::new(EventServer::new(
        verifier,
        digest,
        processor,
        directory,
    ));

    let bind = format!("{}:{}", config.sip.bind_address, config.sip.bind_port).parse()?;
    let mut server = ProxyServer::new(ProxyServerConfig { udp_bind: bind }, routing, events);
    server.start().await?;

    info!("yodel is up");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
