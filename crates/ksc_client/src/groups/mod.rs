//! Reference façade groups.
//!
//! Each group is one server service with one method per endpoint, all
//! delegating to [`ServiceHandle`](crate::ServiceHandle). Obtain them with
//! [`KscClient::group`](crate::KscClient::group).

mod adm_server_settings;
mod event_notification;
mod host_group;
mod host_tags_rules;
mod session;

pub use adm_server_settings::AdmServerSettings;
pub use event_notification::EventNotificationProperties;
pub use host_group::{FindHostsQuery, HostGroup, SortField};
pub use host_tags_rules::HostTagsRulesApi;
pub use session::SessionService;
