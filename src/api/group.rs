//! Purpose: Manage a named, ordered collection of pipes sharing a default
//! channel: fan-out operations and one aggregated change event.
//! Exports: `Group`.
//! Role: The pipeline construct layered over `Pipe`.
//! Invariants: (name, channel) is unique within one group; duplicates are
//! rejected at connect time.
//! Invariants: Sends addressed *to* a member go through a fresh ephemeral
//! sender, so the member's own subscribers are notified exactly as by an
//! external process.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::api::pipe::{ChangeEvent, ChangeHandler, Pipe, PipeConfig, RequestHandler};
use crate::core::envelope::DEFAULT_CHANNEL;
use crate::core::error::{Error, ErrorKind};

struct Fanout<T> {
    handlers: Mutex<Vec<ChangeHandler<T>>>,
}

impl<T> Fanout<T> {
    fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, handler: ChangeHandler<T>) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn dispatch(&self, event: &ChangeEvent<T>) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            handler(event);
        }
    }
}

/// An ordered set of distinct pipes with a default channel, one aggregated
/// change event, and an optional responder shared across members.
pub struct Group<T> {
    default_channel: String,
    config: PipeConfig,
    members: Vec<Pipe<T>>,
    fanout: Arc<Fanout<T>>,
    shared_responder: Option<RequestHandler<T>>,
}

impl<T> Group<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    pub fn new(channel: impl Into<String>) -> Self {
        Self::with_config(channel, PipeConfig::new())
    }

    /// A group on the default channel.
    pub fn on_default_channel() -> Self {
        Self::new(DEFAULT_CHANNEL)
    }

    pub fn with_config(channel: impl Into<String>, config: PipeConfig) -> Self {
        Self {
            default_channel: channel.into(),
            config,
            members: Vec::new(),
            fanout: Arc::new(Fanout::new()),
            shared_responder: None,
        }
    }

    /// Create a group pre-filled with one published pipe per name.
    pub fn with_members<I, S>(channel: impl Into<String>, names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut group = Self::new(channel);
        for name in names {
            group.add(name)?;
        }
        Ok(group)
    }

    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Create a published pipe on the default channel and connect it.
    pub fn add(&mut self, name: impl Into<String>) -> Result<(), Error> {
        let channel = self.default_channel.clone();
        self.add_on(name, channel)
    }

    pub fn add_on(
        &mut self,
        name: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<(), Error> {
        let pipe = Pipe::open_with(name, channel, self.config.clone())?;
        self.connect(pipe)
    }

    /// Wire an existing pipe into the aggregated change event and append it.
    pub fn connect(&mut self, pipe: Pipe<T>) -> Result<(), Error> {
        let at = self.members.len();
        self.connect_at(pipe, at)
    }

    pub fn connect_at(&mut self, pipe: Pipe<T>, index: usize) -> Result<(), Error> {
        if index > self.members.len() {
            return Err(self.out_of_range(index));
        }
        if self.position(pipe.name(), Some(pipe.channel())).is_some() {
            return Err(Error::new(ErrorKind::DuplicateAddress)
                .with_message("a pipe with this name and channel is already connected")
                .with_address(pipe.address_key()));
        }
        let fanout = Arc::clone(&self.fanout);
        pipe.set_group_hook(Arc::new(move |event| fanout.dispatch(event)));
        if let Some(responder) = &self.shared_responder
            && pipe.request_handler().is_none()
        {
            pipe.set_request_handler(Arc::clone(responder));
        }
        self.members.insert(index, pipe);
        Ok(())
    }

    /// Unwire and remove a member, returning it.
    pub fn disconnect(
        &mut self,
        name: &str,
        channel: Option<&str>,
    ) -> Result<Pipe<T>, Error> {
        let index = self
            .position(name, channel)
            .ok_or_else(|| self.not_found(name, channel))?;
        self.disconnect_at(index)
    }

    pub fn disconnect_at(&mut self, index: usize) -> Result<Pipe<T>, Error> {
        if index >= self.members.len() {
            return Err(self.out_of_range(index));
        }
        let pipe = self.members.remove(index);
        pipe.clear_group_hook();
        Ok(pipe)
    }

    pub fn position(&self, name: &str, channel: Option<&str>) -> Option<usize> {
        let channel = channel.unwrap_or(&self.default_channel);
        self.members
            .iter()
            .position(|pipe| pipe.name() == name && pipe.channel() == channel)
    }

    pub fn get(&self, name: &str, channel: Option<&str>) -> Result<&Pipe<T>, Error> {
        let index = self
            .position(name, channel)
            .ok_or_else(|| self.not_found(name, channel))?;
        Ok(&self.members[index])
    }

    /// Register a handler on the aggregated change event; it fires once per
    /// accepted non-request envelope on any member.
    pub fn on_any_change(&mut self, handler: impl Fn(&ChangeEvent<T>) + Send + Sync + 'static) {
        self.fanout.push(Arc::new(handler));
    }

    /// Register one responder shared across members. Applied to every current
    /// and future member that has no responder of its own.
    pub fn on_any_request(
        &mut self,
        handler: impl Fn(&T) -> Result<T, Error> + Send + Sync + 'static,
    ) {
        let responder: RequestHandler<T> = Arc::new(handler);
        for member in &self.members {
            if member.request_handler().is_none() {
                member.set_request_handler(Arc::clone(&responder));
            }
        }
        self.shared_responder = Some(responder);
    }

    /// Deliver to every member through a fresh ephemeral sender per address.
    pub fn send_to_all(&self, value: T) -> Result<(), Error> {
        for member in &self.members {
            self.ephemeral(member.name(), member.channel())?
                .send(value.clone())?;
        }
        Ok(())
    }

    /// Make every member broadcast the value itself.
    pub fn send_from_all(&self, value: T) -> Result<(), Error> {
        for member in &self.members {
            member.send(value.clone())?;
        }
        Ok(())
    }

    /// Deliver to one member as an external sender would.
    pub fn send_to(&self, value: T, name: &str, channel: Option<&str>) -> Result<(), Error> {
        let member = self.get(name, channel)?;
        self.ephemeral(member.name(), member.channel())?.send(value)
    }

    /// Make one member broadcast the value itself.
    pub fn send_from(&self, value: T, name: &str, channel: Option<&str>) -> Result<(), Error> {
        self.get(name, channel)?.send(value)
    }

    /// Store a value on every member without firing their own change events.
    pub fn set_all(&self, value: T) -> Result<(), Error> {
        for member in &self.members {
            member.set_local(value.clone())?;
        }
        Ok(())
    }

    pub fn set_specific(&self, value: T, name: &str, channel: Option<&str>) -> Result<(), Error> {
        self.get(name, channel)?.set_local(value)
    }

    /// One request/response round trip against a member, performed by an
    /// ephemeral sender so the member's own responder answers it.
    pub fn request(&self, value: T, name: &str, channel: Option<&str>) -> Result<T, Error> {
        let member = self.get(name, channel)?;
        self.ephemeral(member.name(), member.channel())?
            .request(value)
    }

    fn ephemeral(&self, name: &str, channel: &str) -> Result<Pipe<T>, Error> {
        Pipe::new(name, channel, self.config.clone())
    }

    fn not_found(&self, name: &str, channel: Option<&str>) -> Error {
        let channel = channel.unwrap_or(&self.default_channel);
        Error::new(ErrorKind::NotFound)
            .with_message("no such pipe is connected to this group")
            .with_address(format!("{channel}-{name}"))
    }

    fn out_of_range(&self, index: usize) -> Error {
        Error::new(ErrorKind::OutOfRange).with_message(format!(
            "position {index} is out of range for {} connected pipes",
            self.members.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::Group;
    use crate::api::pipe::{Pipe, PipeConfig};
    use crate::core::error::ErrorKind;
    use std::time::Duration;

    fn config(root: &std::path::Path) -> PipeConfig {
        PipeConfig::new()
            .with_root(root)
            .with_poll_interval(Duration::from_millis(5))
            .with_request_timeout(Duration::from_millis(250))
    }

    #[test]
    fn add_and_get_members() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut group: Group<String> = Group::with_config("main", config(temp.path()));
        group.add("cmds").expect("add");
        group.add("logs").expect("add");
        assert_eq!(group.len(), 2);
        assert_eq!(group.position("logs", None), Some(1));
        let pipe = group.get("cmds", None).expect("get");
        assert_eq!(pipe.channel(), "main");
        assert!(pipe.is_published());
    }

    #[test]
    fn duplicate_connect_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut group: Group<String> = Group::with_config("main", config(temp.path()));
        group.add("cmds").expect("add");
        let twin = Pipe::new("cmds", "main", config(temp.path())).expect("pipe");
        let err = group.connect(twin).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::DuplicateAddress);
        // same name on another channel is a different address
        group.add_on("cmds", "other").expect("add");
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn connect_at_positions_and_bounds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut group: Group<String> = Group::with_config("main", config(temp.path()));
        group.add("a").expect("add");
        group.add("b").expect("add");

        let front = Pipe::new("c", "main", config(temp.path())).expect("pipe");
        group.connect_at(front, 0).expect("connect");
        assert_eq!(group.position("c", None), Some(0));

        let beyond = Pipe::new("d", "main", config(temp.path())).expect("pipe");
        let err = group.connect_at(beyond, 4).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn disconnect_returns_the_pipe() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut group: Group<String> = Group::with_config("main", config(temp.path()));
        group.add("cmds").expect("add");
        let pipe = group.disconnect("cmds", None).expect("disconnect");
        assert_eq!(pipe.name(), "cmds");
        assert!(group.is_empty());

        let err = group.disconnect("cmds", None).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = group.disconnect_at(0).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn lookup_miss_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let group: Group<i64> = Group::with_config("main", config(temp.path()));
        let err = group.get("nope", None).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = group.request(5, "nope", None).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = group.set_specific(5, "nope", None).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn with_members_fills_the_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut group: Group<String> =
            Group::with_config("main", config(temp.path()));
        for name in ["cmds", "logs"] {
            group.add(name).expect("add");
        }
        assert_eq!(group.len(), 2);
        assert_eq!(group.default_channel(), "main");
    }

    #[test]
    fn set_all_stores_without_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut group: Group<i64> = Group::with_config("main", config(temp.path()));
        group.add("a").expect("add");
        group.add("b").expect("add");
        group.set_all(9).expect("set");
        assert_eq!(group.get("a", None).expect("get").value(), Some(9));
        assert_eq!(group.get("b", None).expect("get").value(), Some(9));
    }
}
