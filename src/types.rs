pub mod podautoscaler;
pub mod serverlessservice;

pub use podautoscaler::{
    PodAutoscaler, PodAutoscalerSpec, PodAutoscalerStatus, Reachability, ScaleStatus,
    ScaleTargetRef,
};
pub use serverlessservice::{
    RoutingMode, ServerlessService, ServerlessServiceSpec, ServerlessServiceStatus,
};

/// Annotation selecting which autoscaler class handles an object.
pub const CLASS_ANNOTATION_KEY: &str = "autoscaling.scaleloop.dev/class";
/// Class handled by this controller unless configured otherwise.
pub const DEFAULT_CLASS: &str = "kpa.autoscaling.scaleloop.dev";
/// Label carried by Endpoints pointing back at their PodAutoscaler.
pub const PODAUTOSCALER_LABEL_KEY: &str = "autoscaling.scaleloop.dev/podautoscaler";
