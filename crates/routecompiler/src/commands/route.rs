//! The `Route` namespace: metadata, signal speeds and the environment.

use super::BuiltIn;
use crate::context::Invocation;
use crate::output::{light_direction, Color24};
use routelang::diagnostics::Fallback;
use routelang::{numbers, DiagnosticKind};
use std::collections::HashMap;

pub fn commands() -> HashMap<&'static str, BuiltIn> {
    HashMap::from([
        ("route.comment", BuiltIn::new(comment).in_preview()),
        ("route.image", BuiltIn::new(image).in_preview()),
        ("route.timetable", BuiltIn::new(timetable)),
        ("route.change", BuiltIn::new(change)),
        ("route.gauge", BuiltIn::new(gauge).in_preview()),
        ("route.signal", BuiltIn::new(signal)),
        ("route.accelerationduetogravity", BuiltIn::new(acceleration_due_to_gravity).in_preview()),
        ("route.starttime", BuiltIn::new(start_time).in_preview()),
        ("route.loadingscreen", BuiltIn::new(loading_screen)),
        ("route.elevation", BuiltIn::new(elevation).in_preview()),
        ("route.temperature", BuiltIn::new(temperature).in_preview()),
        ("route.pressure", BuiltIn::new(pressure).in_preview()),
        ("route.ambientlight", BuiltIn::new(ambient_light).in_preview()),
        ("route.directionallight", BuiltIn::new(directional_light).in_preview()),
        ("route.lightdirection", BuiltIn::new(light_direction_command).in_preview()),
        ("route.initialviewpoint", BuiltIn::new(initial_viewpoint).in_preview()),
        ("route.developerid", BuiltIn::new(developer_id).in_preview()),
    ])
}

/// Returns the first argument, reporting if there is none.
fn required<'c>(inv: &mut Invocation<'c, '_>) -> Option<&'c str> {
    let argument = inv.arg(0);
    if argument.is_none() {
        inv.report(DiagnosticKind::MissingArguments {
            command: inv.name(),
            expected: 1,
        });
    }
    argument
}

/// Reads the first argument as a number, reporting if it is missing or invalid.
fn required_f64(inv: &mut Invocation, argument: &'static str) -> Option<f64> {
    let a = required(inv)?;
    let v = numbers::parse_f64_lenient(a);
    if v.is_none() {
        inv.invalid(argument, Fallback::IgnoreCommand);
    }
    v
}

fn comment(inv: &mut Invocation) {
    if let Some(a) = required(inv) {
        inv.ctx.route.comment = a.to_string();
    }
}

fn image(inv: &mut Invocation) {
    let Some(a) = required(inv) else {
        return;
    };
    let folder = inv.ctx.route_folder.clone();
    if let Some(path) = inv.locate(&folder, a) {
        inv.ctx.route.image = Some(path);
    }
}

fn timetable(inv: &mut Invocation) {
    if let Some(a) = required(inv) {
        inv.ctx.route.timetable = a.to_string();
    }
}

fn change(inv: &mut Invocation) {
    let mut mode = inv.i32_arg(0, "Mode", 0);
    if !(-1..=1).contains(&mode) {
        inv.out_of_range("Mode", "the mode must be -1, 0 or 1", Fallback::value(0));
        mode = 0;
    }
    inv.ctx.route.environment.initial_safety_mode = mode;
}

fn gauge(inv: &mut Invocation) {
    let Some(a) = required_f64(inv, "ValueInMillimeters") else {
        return;
    };
    if a <= 0.0 {
        inv.out_of_range("ValueInMillimeters", "the gauge must be positive", Fallback::IgnoreCommand);
        return;
    }
    inv.ctx.route.environment.gauge = 0.001 * a;
}

fn signal(inv: &mut Invocation) {
    let Some(a) = required_f64(inv, "Speed") else {
        return;
    };
    let index = inv.command.first_index();
    if index < 0 {
        inv.out_of_range("AspectIndex", "the aspect index must be non-negative", Fallback::IgnoreCommand);
        return;
    }
    if a < 0.0 {
        inv.out_of_range("Speed", "the speed must be non-negative", Fallback::IgnoreCommand);
        return;
    }
    let index = index as usize;
    let speed = a * inv.ctx.options.unit_of_speed;
    let speeds = &mut inv.ctx.route.signal_speeds;
    if speeds.len() <= index {
        speeds.resize(index + 1, f64::INFINITY);
    }
    speeds[index] = speed;
}

fn acceleration_due_to_gravity(inv: &mut Invocation) {
    let Some(a) = required_f64(inv, "Value") else {
        return;
    };
    if a <= 0.0 {
        inv.out_of_range("Value", "the acceleration must be positive", Fallback::IgnoreCommand);
        return;
    }
    inv.ctx.route.environment.acceleration_due_to_gravity = a;
}

fn start_time(inv: &mut Invocation) {
    let Some(a) = required(inv) else {
        return;
    };
    match numbers::parse_time(a) {
        None => inv.invalid("Time", Fallback::IgnoreCommand),
        Some(t) => {
            let environment = &mut inv.ctx.route.environment;
            environment.start_time.get_or_insert(t);
        }
    }
}

fn loading_screen(inv: &mut Invocation) {
    let Some(a) = required(inv) else {
        return;
    };
    let folder = inv.ctx.route_folder.clone();
    if let Some(path) = inv.locate(&folder, a) {
        inv.ctx.route.loading_screen = Some(path);
    }
}

fn elevation(inv: &mut Invocation) {
    let Some(a) = required(inv) else {
        return;
    };
    match numbers::parse_length_lenient(a, &inv.ctx.options.unit_of_length) {
        None => inv.invalid("Height", Fallback::IgnoreCommand),
        Some(h) => inv.ctx.route.environment.elevation = h,
    }
}

fn temperature(inv: &mut Invocation) {
    let Some(a) = required_f64(inv, "ValueInCelsius") else {
        return;
    };
    if a <= -273.15 {
        inv.out_of_range(
            "ValueInCelsius",
            "the temperature must be above absolute zero",
            Fallback::IgnoreCommand,
        );
        return;
    }
    inv.ctx.route.environment.temperature = a + 273.15;
}

fn pressure(inv: &mut Invocation) {
    let Some(a) = required_f64(inv, "ValueInKPa") else {
        return;
    };
    if a <= 0.0 {
        inv.out_of_range("ValueInKPa", "the pressure must be positive", Fallback::IgnoreCommand);
        return;
    }
    inv.ctx.route.environment.pressure = 1000.0 * a;
}

fn color_component(inv: &mut Invocation, i: usize, argument: &'static str) -> u8 {
    let v = inv.i32_arg(i, argument, 255);
    if !(0..=255).contains(&v) {
        let clamped = v.clamp(0, 255);
        inv.out_of_range(argument, "color components range from 0 to 255", Fallback::value(clamped));
        return clamped as u8;
    }
    v as u8
}

fn color(inv: &mut Invocation) -> Color24 {
    Color24::new(
        color_component(inv, 0, "RedValue"),
        color_component(inv, 1, "GreenValue"),
        color_component(inv, 2, "BlueValue"),
    )
}

fn ambient_light(inv: &mut Invocation) {
    inv.ctx.route.environment.ambient_light = color(inv);
}

fn directional_light(inv: &mut Invocation) {
    inv.ctx.route.environment.directional_light = color(inv);
}

fn light_direction_command(inv: &mut Invocation) {
    let theta = inv.f64_arg(0, "Theta", 60.0);
    let phi = inv.f64_arg(1, "Phi", -26.565051177078);
    inv.ctx.route.environment.light_direction = light_direction(theta.to_radians(), phi.to_radians());
}

fn initial_viewpoint(inv: &mut Invocation) {
    let Some(a) = required(inv) else {
        return;
    };
    let viewpoint = numbers::parse_i32_lenient(a).unwrap_or(match a.to_ascii_lowercase().as_str() {
        "exterior" => 1,
        "track" => 2,
        "flyby" => 3,
        "flybyzooming" => 4,
        _ => 0,
    });
    if (0..4).contains(&viewpoint) {
        inv.ctx.route.environment.initial_viewpoint = viewpoint;
    } else {
        inv.out_of_range("Value", "the viewpoint must be between 0 and 3", Fallback::IgnoreCommand);
    }
}

fn developer_id(inv: &mut Invocation) {
    if let Some(a) = required(inv) {
        inv.ctx.route.environment.developer_id = Some(a.to_string());
    }
}

#[cfg(test)]
mod tests {
    use crate::options::KMPH;
    use crate::testing::parse_csv;
    use approx::assert_relative_eq;

    #[test]
    fn signal_speeds_grow_with_infinity() {
        let (parsed, diagnostics) = parse_csv("Route.Signal(8) 60");
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        let speeds = &parsed.route.signal_speeds;
        assert_eq!(speeds.len(), 9);
        assert_eq!(speeds[6], f64::INFINITY);
        assert_eq!(speeds[7], f64::INFINITY);
        assert_relative_eq!(speeds[8], 60.0 * KMPH);
        assert_eq!(speeds[0], 0.0);
    }

    #[test]
    fn environment() {
        let (parsed, diagnostics) = parse_csv(
            "Route.Gauge 1067\nRoute.Temperature 10\nRoute.Pressure 90\n\
             Route.AmbientLight 300;20\nRoute.StartTime 10.30\nRoute.StartTime 12",
        );
        assert_eq!(diagnostics.len(), 1, "{diagnostics:?}");
        let environment = &parsed.route.environment;
        assert_relative_eq!(environment.gauge, 1.067);
        assert_relative_eq!(environment.temperature, 283.15);
        assert_relative_eq!(environment.pressure, 90000.0);
        assert_eq!(environment.ambient_light, crate::output::Color24::new(255, 20, 255));
        assert_eq!(environment.start_time, Some(37800.0));
    }

    #[test]
    fn invalid_values_are_ignored() {
        let (parsed, diagnostics) = parse_csv("Route.Gauge -3\nRoute.Change 4\nRoute.InitialViewpoint 7");
        assert_eq!(diagnostics.len(), 3, "{diagnostics:?}");
        assert_eq!(parsed.route.environment.gauge, 1.435);
        assert_eq!(parsed.route.environment.initial_safety_mode, 0);
        assert_eq!(parsed.route.environment.initial_viewpoint, 0);
    }

    #[test]
    fn initial_viewpoint_keywords() {
        let (parsed, _) = parse_csv("Route.InitialViewpoint flyby");
        assert_eq!(parsed.route.environment.initial_viewpoint, 3);
    }

    #[test]
    fn comment_and_missing_image() {
        let (parsed, diagnostics) = parse_csv("Route.Comment A test route\nRoute.Image missing.png");
        assert_eq!(parsed.route.comment, "A test route");
        assert_eq!(parsed.route.image, None);
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].critical);
    }
}
