use std::any::Any;
use std::fmt::Debug;
use std::sync::Mutex;

use console::Style;

use crate::core::lock;
use crate::error::SinkError;
use crate::meta::{Meta, Value};
use crate::name::Name;

const ANSI_CYAN: Style = Style::new().cyan();

/// One item handed to a [`Sink`].
pub struct Output<'a> {
    pub name: &'a Name,
    pub meta: &'a Meta,
    value: &'a dyn Any,
    debug: &'a dyn Debug,
}

impl<'a> Output<'a> {
    pub fn new<T: Any + Debug>(name: &'a Name, value: &'a T, meta: &'a Meta) -> Self {
        Self {
            name,
            meta,
            value,
            debug: value,
        }
    }

    pub fn downcast<T: Any>(&self) -> Option<&'a T> {
        self.value.downcast_ref::<T>()
    }

    /// Generic textual form, used when no renderer accepts the value.
    pub fn fallback(&self) -> String {
        format!("{:?}", self.debug)
    }
}

/// Receives finished values, for display or recording.
pub trait Sink: Send + Sync {
    fn push(&self, output: &Output<'_>) -> Result<(), SinkError>;

    /// Drops accumulated content. A no-op for sinks that keep nothing.
    fn clear(&self) {}
}

type Accepts = Box<dyn Fn(&Output<'_>) -> bool + Send + Sync>;
type Render = Box<dyn Fn(&Output<'_>) -> anyhow::Result<String> + Send + Sync>;

/// A type predicate paired with the function rendering matching values.
pub struct Renderer {
    name: &'static str,
    accepts: Accepts,
    render: Render,
}

impl Renderer {
    pub fn new<A, R>(name: &'static str, accepts: A, render: R) -> Self
    where
        A: Fn(&Output<'_>) -> bool + Send + Sync + 'static,
        R: Fn(&Output<'_>) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            name,
            accepts: Box::new(accepts),
            render: Box::new(render),
        }
    }

    /// Renders values of type `T`.
    pub fn for_type<T, R>(name: &'static str, render: R) -> Self
    where
        T: Any,
        R: Fn(&T, &Meta) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self::new(
            name,
            |output| output.downcast::<T>().is_some(),
            move |output| match output.downcast::<T>() {
                Some(value) => render(value, output.meta),
                None => Ok(output.fallback()),
            },
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Renderers for the plain value types, in the order they are tried.
pub fn default_renderers() -> Vec<Renderer> {
    vec![
        Renderer::for_type::<String, _>("string", |s, _| Ok(s.clone())),
        Renderer::for_type::<&'static str, _>("str", |s, _| Ok(s.to_string())),
        Renderer::for_type::<Value, _>("value", |v, _| Ok(v.to_string())),
        Renderer::for_type::<Meta, _>("meta", |m, _| Ok(m.canonical())),
        Renderer::for_type::<serde_json::Value, _>("json", |v, _| {
            Ok(serde_json::to_string_pretty(v)?)
        }),
    ]
}

/// Collects one line of text per pushed item.
pub struct TextSink {
    renderers: Vec<Renderer>,
    lines: Mutex<Vec<String>>,
    echo: bool,
}

impl TextSink {
    pub fn new() -> Self {
        Self {
            renderers: default_renderers(),
            lines: Mutex::new(Vec::new()),
            echo: false,
        }
    }

    /// Tries `renderer` before any renderer added earlier.
    pub fn renderer(mut self, renderer: Renderer) -> Self {
        self.renderers.insert(0, renderer);
        self
    }

    /// Also prints every line to stdout.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    fn render(&self, output: &Output<'_>) -> Result<String, SinkError> {
        match self.renderers.iter().find(|r| (r.accepts)(output)) {
            Some(renderer) => {
                (renderer.render)(output).map_err(|e| SinkError::Render(renderer.name, e))
            }
            None => Ok(output.fallback()),
        }
    }
}

impl Default for TextSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for TextSink {
    fn push(&self, output: &Output<'_>) -> Result<(), SinkError> {
        let text = self.render(output)?;

        if self.echo {
            println!("{} {}", ANSI_CYAN.apply_to(output.name), text);
        }

        lock(&self.lines).push(format!("{}: {}", output.name, text));
        Ok(())
    }

    fn clear(&self) {
        lock(&self.lines).clear();
    }
}
