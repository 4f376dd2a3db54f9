//! The `eventcontroller` agent: keeps event definitions and exposes each one
//! as a bus device.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;

use homebus_app::connection::Connection;
use homebus_app::dispatcher::HandlerError;
use homebus_app::ports::{Transport, UuidStore};
use homebus_domain::command::{CommandError, require_object, require_str};
use homebus_domain::device::{NewDevice, UuidAssignment};
use homebus_domain::envelope::Content;
use homebus_domain::error::BusError;
use homebus_domain::id::new_device_uuid;
use homebus_domain::response::Response;

/// Internal id of the controller device.
pub const CONTROLLER_ID: &str = "eventcontroller";
/// Device type of the controller device.
pub const CONTROLLER_TYPE: &str = "eventcontroller";
/// Device type of every registered event.
pub const EVENT_TYPE: &str = "event";

/// Answers the `setevent`, `getevent` and `delevent` commands.
pub struct EventController<T, S> {
    connection: Weak<Connection<T, S>>,
    events: Mutex<BTreeMap<String, Value>>,
}

impl<T, S> EventController<T, S>
where
    T: Transport + 'static,
    S: UuidStore + 'static,
{
    /// Register the controller device on `connection` and install the
    /// command handler.
    ///
    /// # Errors
    ///
    /// Propagates the registration failure of the controller device.
    pub async fn install(connection: &Arc<Connection<T, S>>) -> Result<Arc<Self>, BusError> {
        connection.add_device(CONTROLLER_ID, CONTROLLER_TYPE).await?;

        let controller = Arc::new(Self {
            connection: Arc::downgrade(connection),
            events: Mutex::new(BTreeMap::new()),
        });
        let handler = Arc::clone(&controller);
        connection.add_command_handler(move |content| {
            let controller = Arc::clone(&handler);
            async move { controller.handle(content).await }
        });
        tracing::info!(device = CONTROLLER_ID, "event controller installed");
        Ok(controller)
    }

    /// Number of known events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn connection(&self) -> Result<Arc<Connection<T, S>>, HandlerError> {
        self.connection
            .upgrade()
            .ok_or(HandlerError::Bus(BusError::Shutdown))
    }

    async fn handle(&self, content: Content) -> Result<Response, HandlerError> {
        let internal_id = require_str(&content, "internalid", false)?;
        if internal_id != CONTROLLER_ID {
            return Ok(Response::no_device_commands());
        }
        match content.get("command").and_then(Value::as_str) {
            Some("setevent") => self.set_event(&content).await,
            Some("getevent") => self.get_event(&content),
            Some("delevent") => self.delete_event(&content).await,
            _ => Ok(Response::unknown_command()),
        }
    }

    #[tracing::instrument(skip_all)]
    async fn set_event(&self, content: &Content) -> Result<Response, HandlerError> {
        let eventmap = require_object(content, "eventmap")?.clone();
        let event = match content.get("event").and_then(Value::as_str) {
            Some(uuid) if !uuid.is_empty() => uuid.to_string(),
            _ => new_device_uuid(),
        };

        let device = NewDevice::builder()
            .internal_id(event.clone())
            .device_type(EVENT_TYPE)
            .assignment(UuidAssignment::UseInternalId)
            .build()
            .map_err(BusError::from)?;
        self.connection()?.add_device_with(device).await?;

        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.clone(), Value::Object(eventmap));
        tracing::debug!(%event, "event stored");

        let mut data = Content::new();
        data.insert("event".into(), Value::String(event));
        Ok(Response::success_with_data(data))
    }

    fn get_event(&self, content: &Content) -> Result<Response, HandlerError> {
        let event = require_str(content, "event", false)?;
        let eventmap = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .ok_or_else(|| CommandError::failed(format!("Unknown event {event}")))?;

        let mut data = Content::new();
        data.insert("eventmap".into(), eventmap);
        data.insert("event".into(), Value::String(event.to_string()));
        Ok(Response::success_with_data(data))
    }

    #[tracing::instrument(skip_all)]
    async fn delete_event(&self, content: &Content) -> Result<Response, HandlerError> {
        let event = require_str(content, "event", false)?.to_string();
        let removed = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event);
        if removed.is_some() {
            self.connection()?.purge_device(&event).await;
            tracing::debug!(%event, "event removed");
        }
        // Deleting an unknown event is not an error: it is already gone.
        Ok(Response::success())
    }
}
