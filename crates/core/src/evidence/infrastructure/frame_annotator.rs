use crate::decision::domain::action::Reason;
use crate::shared::frame::Frame;
use crate::shared::region::Region;

const LINE_THICKNESS: i32 = 3;

/// Outline color for each cause, RGB.
pub fn color_for(reason: Reason) -> [u8; 3] {
    match reason {
        Reason::PhoneDetection => [255, 0, 0],
        Reason::SpoofImage => [255, 140, 0],
        Reason::WrongUser => [255, 215, 0],
        _ => [0, 255, 0],
    }
}

/// Draws the cause box onto a copy of `frame`.
///
/// Frames without a box (no face) are returned unchanged.
pub fn annotate(frame: &Frame, evidence_box: Option<Region>, reason: Reason) -> Frame {
    let mut annotated = frame.clone();
    if let Some(region) = evidence_box {
        draw_outline(&mut annotated, &region, color_for(reason), LINE_THICKNESS);
    }
    annotated
}

/// Paints a rectangle outline in place, clipped to the frame.
pub fn draw_outline(frame: &mut Frame, region: &Region, color: [u8; 3], thickness: i32) {
    let Some(r) = region.clamp_to(frame.width(), frame.height()) else {
        return;
    };
    let fw = frame.width() as usize;
    let channels = frame.channels() as usize;
    let t = thickness.max(1);
    let (x1, y1) = (r.x, r.y);
    let (x2, y2) = (r.x + r.width, r.y + r.height);
    let data = frame.data_mut();

    for y in y1..y2 {
        for x in x1..x2 {
            let on_edge = x - x1 < t || x2 - 1 - x < t || y - y1 < t || y2 - 1 - y < t;
            if !on_edge {
                continue;
            }
            let offset = (y as usize * fw + x as usize) * channels;
            data[offset..offset + 3].copy_from_slice(&color);
        }
    }
}
