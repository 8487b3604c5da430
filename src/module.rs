//! Application modules.
//!
//! An [`Application`] owns a list of boxed [`Module`]s and drives their lifecycle. It does not
//! own a window: the embedder forwards resizes through [`Application::resize`] and calls
//! [`Application::tick`] (or [`Application::update`] with its own clock) once per loop
//! iteration.
//!
//! The context type is a parameter so modules can share whatever state the embedder provides.
//! It defaults to the engine [`Context`].

use std::time::Instant;

use crate::{context::Context, error::Result};

/// Upper bound on the frame time handed to modules, in seconds.
///
/// Long stalls (window drags, breakpoints) would otherwise produce huge simulation steps.
pub const MAX_FRAME_TIME: f32 = 1.0 / 30.0;

pub fn clamp_frame_time(delta_time: f32) -> f32 {
    delta_time.clamp(0.0, MAX_FRAME_TIME)
}

pub trait Module<C = Context> {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_attach(&mut self, _context: &C) -> Result<()> {
        Ok(())
    }

    fn on_update(&mut self, context: &C, delta_time: f32) -> Result<()>;

    /// The window's framebuffer was resized. Width or height may be zero while minimized.
    fn on_resize(&mut self, _context: &C, _width: u32, _height: u32) {}

    fn on_detach(&mut self, _context: &C) {}
}

/// Owns modules and runs them in insertion order. Modules are detached in reverse order when
/// the application is dropped.
pub struct Application<C = Context> {
    modules: Vec<Box<dyn Module<C>>>,
    last_tick: Option<Instant>,
    context: C,
}

impl<C> Application<C> {
    pub fn new(context: C) -> Self {
        Self {
            modules: Vec::new(),
            last_tick: None,
            context,
        }
    }

    /// Attaches `module` and appends it. A module whose `on_attach` fails is dropped.
    pub fn add_module(&mut self, mut module: Box<dyn Module<C>>) -> Result<&mut Self> {
        module.on_attach(&self.context)?;
        tracing::debug!(module = module.name(), "Module attached");
        self.modules.push(module);
        Ok(self)
    }

    pub fn with_module(mut self, module: impl Module<C> + 'static) -> Result<Self> {
        self.add_module(Box::new(module))?;
        Ok(self)
    }

    /// Updates every module with `delta_time` clamped to [`MAX_FRAME_TIME`].
    pub fn update(&mut self, delta_time: f32) -> Result<()> {
        let delta_time = clamp_frame_time(delta_time);
        for module in &mut self.modules {
            module.on_update(&self.context, delta_time)?;
        }
        Ok(())
    }

    /// Measures the time since the previous tick and updates every module with it.
    ///
    /// The first tick reports a frame time of zero.
    pub fn tick(&mut self) -> Result<()> {
        let now = Instant::now();
        let delta_time = self
            .last_tick
            .replace(now)
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32());
        self.update(delta_time)
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        tracing::trace!(width, height, "Resize");
        for module in &mut self.modules {
            module.on_resize(&self.context, width, height);
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

impl<C> Drop for Application<C> {
    fn drop(&mut self) {
        while let Some(mut module) = self.modules.pop() {
            module.on_detach(&self.context);
            tracing::debug!(module = module.name(), "Module detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::error::Error;

    type Log = RefCell<Vec<String>>;

    struct Recorder(&'static str);

    impl Module<Log> for Recorder {
        fn on_attach(&mut self, log: &Log) -> Result<()> {
            log.borrow_mut().push(format!("attach {}", self.0));
            Ok(())
        }
        fn on_update(&mut self, log: &Log, delta_time: f32) -> Result<()> {
            log.borrow_mut().push(format!("update {} {delta_time}", self.0));
            Ok(())
        }
        fn on_resize(&mut self, log: &Log, width: u32, height: u32) {
            log.borrow_mut().push(format!("resize {} {width}x{height}", self.0));
        }
        fn on_detach(&mut self, log: &Log) {
            log.borrow_mut().push(format!("detach {}", self.0));
        }
    }

    struct FailsToAttach;

    impl Module<Log> for FailsToAttach {
        fn on_attach(&mut self, _: &Log) -> Result<()> {
            Err(Error::PoolExhausted)
        }
        fn on_update(&mut self, log: &Log, _: f32) -> Result<()> {
            log.borrow_mut().push("unreachable update".into());
            Ok(())
        }
    }

    #[test]
    fn lifecycle_order() {
        let log = {
            let mut app = Application::new(Log::default())
                .with_module(Recorder("a"))
                .unwrap()
                .with_module(Recorder("b"))
                .unwrap();
            app.update(0.01).unwrap();
            app.resize(640, 480);
            assert_eq!(app.module_count(), 2);
            // Take a copy before drop runs the detach hooks.
            let snapshot = app.context().borrow().clone();
            drop(app);
            snapshot
        };
        assert_eq!(
            log,
            [
                "attach a",
                "attach b",
                "update a 0.01",
                "update b 0.01",
                "resize a 640x480",
                "resize b 640x480",
            ]
        );
    }

    #[test]
    fn detach_runs_in_reverse_order() {
        struct Shared(std::rc::Rc<Log>, &'static str);
        impl Module<()> for Shared {
            fn on_update(&mut self, _: &(), _: f32) -> Result<()> {
                Ok(())
            }
            fn on_detach(&mut self, _: &()) {
                self.0.borrow_mut().push(self.1.to_owned());
            }
        }

        let log = std::rc::Rc::new(Log::default());
        let app = Application::new(())
            .with_module(Shared(log.clone(), "first"))
            .unwrap()
            .with_module(Shared(log.clone(), "second"))
            .unwrap();
        drop(app);
        assert_eq!(*log.borrow(), ["second", "first"]);
    }

    #[test]
    fn failed_attach_is_not_kept() {
        let mut app = Application::new(Log::default());
        assert!(app.add_module(Box::new(FailsToAttach)).is_err());
        assert_eq!(app.module_count(), 0);
        app.update(0.01).unwrap();
        assert!(app.context().borrow().is_empty());
    }

    #[test]
    fn frame_time_is_clamped() {
        assert_eq!(clamp_frame_time(0.5), MAX_FRAME_TIME);
        assert_eq!(clamp_frame_time(0.01), 0.01);
        assert_eq!(clamp_frame_time(-1.0), 0.0);

        let mut app = Application::new(Log::default())
            .with_module(Recorder("a"))
            .unwrap();
        app.update(2.0).unwrap();
        assert_eq!(
            app.context().borrow().last().map(String::as_str),
            Some(format!("update a {MAX_FRAME_TIME}").as_str())
        );
    }

    #[test]
    fn first_tick_is_zero() {
        let mut app = Application::new(Log::default())
            .with_module(Recorder("a"))
            .unwrap();
        app.tick().unwrap();
        assert_eq!(
            app.context().borrow().last().map(String::as_str),
            Some("update a 0")
        );
    }
}
