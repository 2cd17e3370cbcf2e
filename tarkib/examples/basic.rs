//! Basic example of the Tarkib DI container.

use std::sync::Arc;

use tarkib::prelude::*;

// === Define your traits and types ===

trait Logger: Send + Sync {
    fn log(&self, msg: &str);
}

struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn log(&self, msg: &str) {
        println!("[LOG] {msg}");
    }
}

struct Config {
    database_url: String,
    debug: bool,
}

struct Database {
    url: String,
    logger: Arc<dyn Logger>,
}

impl Database {
    fn query(&self, sql: &str) -> String {
        self.logger.log(&format!("Executing: {sql}"));
        format!("Results from {}", self.url)
    }
}

impl Dispose for Database {
    fn dispose(&self) {
        self.logger.log(&format!("Closing connection to {}", self.url));
    }
}

struct UserRepository {
    db: Arc<Database>,
}

impl UserRepository {
    fn find_user(&self, id: u64) -> String {
        self.db.query(&format!("SELECT * FROM users WHERE id = {id}"))
    }
}

struct UserService {
    repo: Arc<UserRepository>,
    logger: Arc<dyn Logger>,
}

impl UserService {
    fn get_user(&self, id: u64) -> String {
        self.logger.log(&format!("Getting user {id}"));
        self.repo.find_user(id)
    }
}

fn main() -> Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt()
        .with_env_filter("tarkib=debug")
        .init();

    let container = Container::new();

    // Config — already-built instance
    container.register_instance(Config {
        database_url: "postgres://localhost/myapp".to_string(),
        debug: true,
    });
    // Logger — singleton
    container.register_with::<Arc<dyn Logger>>(Reuse::Singleton, |_| {
        Ok(Arc::new(ConsoleLogger) as Arc<dyn Logger>)
    });
    // Database — singleton (depends on Config + Logger), disposed with the container
    container.register(
        ServiceKey::of::<Database>(),
        Factory::of::<Database>(|ctx| {
            let config: Arc<Config> = ctx.resolve()?;
            let logger: Arc<Arc<dyn Logger>> = ctx.resolve()?;
            Ok(Database {
                url: config.database_url.clone(),
                logger: (*logger).clone(),
            })
        })
        .with_reuse(Reuse::Singleton)
        .dispose_with::<Database>(),
    );
    // UserRepository — one per scope (e.g. per request)
    container.register_with::<UserRepository>(Reuse::InCurrentScope, |ctx| {
        Ok(UserRepository { db: ctx.resolve()? })
    });
    // UserService — transient (new each time)
    container.register_with::<UserService>(Reuse::Transient, |ctx| {
        let logger: Arc<Arc<dyn Logger>> = ctx.resolve()?;
        Ok(UserService {
            repo: ctx.resolve()?,
            logger: (*logger).clone(),
        })
    });

    container.validate()?;
    println!("Container ready: {container:?}");

    let config: Arc<Config> = container.resolve()?;
    println!(
        "Config: database_url={}, debug={}",
        config.database_url, config.debug
    );

    // === Open a scope (e.g. for an HTTP request) ===
    {
        let scope = container.open_scope();

        let service: Arc<UserService> = scope.resolve()?;
        println!("{}", service.get_user(42));

        // Resolve again in the same scope — UserRepository is reused
        let service2: Arc<UserService> = scope.resolve()?;
        println!("{}", service2.get_user(7));
    }
    // scope dropped — its cached instances are released

    container.dispose();
    Ok(())
}
