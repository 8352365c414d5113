use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blockchain_namespace::config::KEY_FAIL_FAST_ON_FETCH_ERROR;
use blockchain_namespace::{
    App, Context, Environment, FetchError, Graph, InMemoryRemote, Language, NamespaceConfig,
    NamespaceResult, Reference,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const LEXICON: &str = r#"{
    "blockchain": {
        "app": {
            "configuration": {
                "swap": { "is": { "enabled": {} } },
                "greeting": {}
            }
        },
        "ux": {
            "theme": { "@type": "blockchain.session.state.preference.value" },
            "onboarding": {
                "seen": { "@type": "blockchain.session.state.shared.value" }
            },
            "tap": {},
            "did": { "tap": {} }
        }
    }
}"#;

fn language() -> Language {
    Language::new(Graph::from_json(LEXICON).expect("lexicon")).expect("language")
}

fn config() -> NamespaceConfig {
    NamespaceConfig::new(Environment::Test).with(KEY_FAIL_FAST_ON_FETCH_ERROR, "true")
}

fn open(root: &TempDir, remote: Arc<InMemoryRemote>) -> NamespaceResult<App> {
    let language = language();
    let greeting = Reference::parse("blockchain.app.configuration.greeting", &language)?;
    App::open(
        root.path(),
        language,
        config(),
        remote,
        [(greeting, json!("hello"))],
    )
}

async fn synchronized(app: &App) {
    tokio::time::timeout(
        Duration::from_secs(5),
        app.remote_configuration().synchronized(),
    )
    .await
    .expect("remote configuration synchronized");
}

#[tokio::test]
async fn session_survives_restart() -> NamespaceResult<()> {
    let root = TempDir::new().expect("create temp dir");
    let remote = Arc::new(InMemoryRemote::new().with("ios_ff_swap", json!(true)));

    {
        let app = open(&root, remote.clone())?;
        let swap = app.reference("blockchain.app.configuration.swap.is.enabled")?;
        let greeting = app.reference("blockchain.app.configuration.greeting")?;
        let theme = app.reference("blockchain.ux.theme")?;
        let seen = app.reference("blockchain.ux.onboarding.seen")?;

        assert_eq!(
            app.remote_configuration().get(&swap),
            Err(FetchError::NotSynchronized)
        );
        app.start()?;
        synchronized(&app).await;

        assert!(app.result(&swap).is_yes());
        assert_eq!(app.result(&greeting).get(), Ok(json!("hello")));

        app.sign_in("alice")?;
        app.set(&theme, "dark");
        app.set(&seen, true);
        app.set(&greeting, "bonjour");
        assert_eq!(app.result(&greeting).get(), Ok(json!("bonjour")));
    }

    let app = open(&root, remote)?;
    let greeting = app.reference("blockchain.app.configuration.greeting")?;
    let theme = app.reference("blockchain.ux.theme")?;
    let seen = app.reference("blockchain.ux.onboarding.seen")?;
    app.start()?;
    synchronized(&app).await;

    assert_eq!(app.result(&greeting).get(), Ok(json!("bonjour")));
    assert_eq!(app.state().get(&seen), Ok(json!(true)));
    assert!(matches!(
        app.state().get(&theme),
        Err(FetchError::KeyDoesNotExist(_))
    ));

    app.sign_in("alice")?;
    assert_eq!(app.state().get(&theme), Ok(json!("dark")));

    app.sign_out()?;
    assert_eq!(app.state().get(&theme), Ok(json!("dark")));
    app.sign_in("bob")?;
    assert!(app.state().get(&theme).is_err());
    Ok(())
}

#[tokio::test]
async fn observers_forward_events_from_stored_rules() -> NamespaceResult<()> {
    let root = TempDir::new().expect("create temp dir");
    let app = open(&root, Arc::new(InMemoryRemote::new()))?;
    app.start()?;

    let tap = app.reference("blockchain.ux.tap")?;
    let did_tap = app.reference("blockchain.ux.did.tap")?;
    let observers = app.reference("blockchain.session.state.observers")?;

    let forwarded = Arc::new(AtomicUsize::new(0));
    let counter = forwarded.clone();
    let _listener = app.on([&did_tap], move |event| {
        assert_eq!(event.context.get("origin"), Some(&Value::from("test")));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let rules = json!([{
        "event": { "tag": "blockchain.ux.tap", "notification": true },
        "action": "blockchain.ux.did.tap"
    }]);
    app.set(&observers, rules.clone());
    app.set(&observers, rules);

    tokio::time::timeout(Duration::from_secs(5), async {
        while app.observers().installed() != (1, 0) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("rules installed");

    app.post(&tap, Context::new().with("origin", "test"));
    tokio::time::timeout(Duration::from_secs(5), async {
        while forwarded.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("event forwarded");

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn types_contribute_children() -> NamespaceResult<()> {
    let graph = Graph::from_json(
        r#"{
            "a": { "b": { "c": { "@type": "t" } } },
            "t": { "d": {} }
        }"#,
    )?;
    let language = Language::new(graph)?;
    let c = language.resolve("a.b.c")?;
    let t = language.resolve("t")?;

    assert!(c.children().contains_key("d"));
    assert!(c.is(&t));
    assert_eq!(c.child("d")?.id(), "a.b.c.d");
    Ok(())
}
