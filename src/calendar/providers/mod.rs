/*!
 * Calendar Providers
 *
 * Adapters for the three supported calendar backends behind one capability
 * surface: Google Calendar (REST + OAuth2), Microsoft Graph (REST + OAuth2),
 * and Apple iCloud (CalDAV + app-specific password).
 */

pub mod caldav;
pub mod google;
pub mod outlook;
pub mod traits;

pub use caldav::AppleCalendarProvider;
pub use google::GoogleCalendarProvider;
pub use outlook::OutlookCalendarProvider;
pub use traits::CalendarProviderTrait;
