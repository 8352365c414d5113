//! Ids of the core lexicon tags the engine itself branches on.

pub const NONE: &str = "blockchain.db.type.tag.none";
pub const DB_COLLECTION: &str = "blockchain.db.collection";
pub const DB_COLLECTION_ID: &str = "blockchain.db.collection.id";
pub const DB_LEAF: &str = "blockchain.db.leaf";

pub const USER_ID: &str = "blockchain.user.id";

pub const SESSION_STATE: &str = "blockchain.session.state";
pub const SESSION_STATE_VALUE: &str = "blockchain.session.state.value";
pub const SESSION_STATE_PREFERENCE_VALUE: &str = "blockchain.session.state.preference.value";
pub const SESSION_STATE_SHARED_VALUE: &str = "blockchain.session.state.shared.value";
pub const SESSION_STATE_OBSERVERS: &str = "blockchain.session.state.observers";

pub const SESSION_CONFIGURATION: &str = "blockchain.session.configuration";
pub const SESSION_CONFIGURATION_VALUE: &str = "blockchain.session.configuration.value";

pub const SESSION_EVENT_WILL_SIGN_IN: &str = "blockchain.session.event.will.sign.in";
pub const SESSION_EVENT_DID_SIGN_IN: &str = "blockchain.session.event.did.sign.in";
pub const SESSION_EVENT_WILL_SIGN_OUT: &str = "blockchain.session.event.will.sign.out";
pub const SESSION_EVENT_DID_SIGN_OUT: &str = "blockchain.session.event.did.sign.out";

pub const APP_CONFIGURATION: &str = "blockchain.app.configuration";
pub const APP_CONFIGURATION_REMOTE_IS_STALE: &str = "blockchain.app.configuration.remote.is.stale";

pub const PRIVACY_POLICY: &str = "blockchain.ux.type.analytics.privacy.policy";
pub const PRIVACY_POLICY_INCLUDE: &str = "blockchain.ux.type.analytics.privacy.policy.include";
pub const PRIVACY_POLICY_EXCLUDE: &str = "blockchain.ux.type.analytics.privacy.policy.exclude";
pub const PRIVACY_POLICY_OBFUSCATE: &str = "blockchain.ux.type.analytics.privacy.policy.obfuscate";

pub const NABU_EXPERIMENT: &str = "blockchain.ux.user.nabu.experiment";
pub const NABU_EXPERIMENT_ID: &str = "blockchain.ux.user.nabu.experiment.id";
pub const NABU_EXPERIMENT_GROUP: &str = "blockchain.ux.user.nabu.experiment.group";
