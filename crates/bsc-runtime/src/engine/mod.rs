include!("lifecycle.rs");
include!("local_state.rs");
include!("halt.rs");
include!("scope_guard.rs");
include!("progress.rs");
include!("expand.rs");
include!("macros.rs");
include!("section.rs");
include!("dispatch.rs");
include!("branch.rs");
include!("control.rs");
include!("run_loop.rs");
include!("tests.rs");
